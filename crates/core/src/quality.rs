use crate::error::CollectError;
use crate::models::{ExtractedRecord, ExtractionSchema, QualityFlag, Severity};
use crate::prompts;
use crate::traits::CompletionModel;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Flags likely errors in extracted records: local schema and grounding
/// checks, then one LLM review of the whole dataset.
pub struct QualityController {
    model: Arc<dyn CompletionModel>,
}

impl QualityController {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }

    /// Returns `records` with their quality flags appended.
    pub async fn control(
        &self,
        mut records: Vec<ExtractedRecord>,
        dataset_description: &str,
        schema: Option<&ExtractionSchema>,
    ) -> Result<Vec<ExtractedRecord>, CollectError> {
        if records.is_empty() {
            return Ok(records);
        }

        for record in &mut records {
            let flags = local_flags(record, schema);
            record.flags.extend(flags);
        }

        let csv = render_csv(&records, schema)?;
        let prompt = prompts::render(
            prompts::QUALITY_CONTROL,
            &[
                ("dataset_description", dataset_description),
                ("extracted_data", csv.as_str()),
            ],
        );
        let reply = self.model.complete(&prompt).await?;

        let known = records.iter().map(|record| record.id).collect::<HashSet<_>>();
        let issues = parse_issues(&reply, &known);
        debug!(issues = issues.len(), "quality review parsed");

        for (id, issue) in issues {
            if let Some(record) = records.iter_mut().find(|record| record.id == id) {
                record.flags.push(QualityFlag {
                    record_id: id,
                    issue,
                    severity: Severity::Warning,
                });
            }
        }

        info!(
            records = records.len(),
            flagged = records.iter().filter(|record| !record.flags.is_empty()).count(),
            errors = records
                .iter()
                .flat_map(|record| &record.flags)
                .filter(|flag| flag.severity == Severity::Error)
                .count(),
            "quality control finished"
        );
        Ok(records)
    }
}

/// Schema conformance and grounding flags that need no model call.
pub fn local_flags(record: &ExtractedRecord, schema: Option<&ExtractionSchema>) -> Vec<QualityFlag> {
    let mut flags = Vec::new();
    let mut flag = |issue: String, severity: Severity| {
        flags.push(QualityFlag {
            record_id: record.id,
            issue,
            severity,
        })
    };

    if let Some(schema) = schema {
        for field in &schema.fields {
            match record.fields.get(&field.name) {
                None | Some(Value::Null) => {
                    flag(format!("'{}' has no value", field.name), Severity::Info)
                }
                Some(value) if !field.kind.accepts(value) => flag(
                    format!("'{}' is not a {}: {value}", field.name, field.kind.json_type()),
                    Severity::Error,
                ),
                Some(_) => {}
            }
        }
    }

    if !record.is_grounded {
        flag(
            "grounding quote was not found in the source page".to_string(),
            Severity::Warning,
        );
    }

    flags
}

/// Records as CSV with the id column first; urls are left out.
pub fn render_csv(
    records: &[ExtractedRecord],
    schema: Option<&ExtractionSchema>,
) -> Result<String, CollectError> {
    let columns = match schema {
        Some(schema) => schema.fields.iter().map(|field| field.name.clone()).collect(),
        None => {
            let mut columns: Vec<String> = Vec::new();
            for name in records.iter().flat_map(|record| record.fields.keys()) {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
            columns
        }
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(std::iter::once("ID").chain(columns.iter().map(String::as_str)))?;

    for record in records {
        let mut row = vec![record.id.to_string()];
        for column in &columns {
            row.push(match record.fields.get(column) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
            });
        }
        writer.write_record(&row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|error| CollectError::Io(error.into_error()))?;
    String::from_utf8(bytes)
        .map_err(|error| CollectError::InvalidArgument(format!("csv is not utf-8: {error}")))
}

/// `ID: issue` lines of the review reply. `NA` answers, lines without an id
/// and ids not in `known` are ignored.
pub fn parse_issues(reply: &str, known: &HashSet<usize>) -> Vec<(usize, String)> {
    reply
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches(['-', '*']).trim();
            let (id, issue) = line.split_once(':')?;

            let id = id.trim();
            let id = id
                .strip_prefix("ID")
                .or_else(|| id.strip_prefix("id"))
                .unwrap_or(id)
                .trim()
                .parse::<usize>()
                .ok()?;

            let issue = issue.trim();
            let answer = issue.trim_end_matches('.');
            if answer.is_empty() || answer.eq_ignore_ascii_case("NA") || answer.eq_ignore_ascii_case("N/A") {
                return None;
            }
            known.contains(&id).then(|| (id, issue.to_string()))
        })
        .collect()
}
