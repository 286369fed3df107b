use crate::config::ExtractionConfig;
use crate::content::{
    looks_like_pdf_url, page_from_fetched, pdf_text_layer, strip_code_fences, truncate_chars,
};
use crate::error::{CollectError, ConfigError};
use crate::grounding::{check_grounding, citation_url};
use crate::models::{ContentKind, ExtractedRecord, ExtractionSchema, SkippedItem, WebPage};
use crate::prompts;
use crate::traits::{CompletionModel, OcrProvider, PageFetcher};
use async_stream::stream;
use futures::stream::{self as futures_stream, Stream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keys an LLM may wrap its datapoint array in.
const WRAPPER_KEYS: [&str; 5] = ["items", "data", "records", "datapoints", "results"];

#[derive(Debug, Default, Serialize)]
pub struct ExtractionReport {
    pub records: Vec<ExtractedRecord>,
    pub skipped: Vec<SkippedItem>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExtractionEvent {
    Record(ExtractedRecord),
    Skipped(SkippedItem),
    PageDone { url: String, records: usize },
}

/// Records of one page before ids are assigned.
struct PageOutcome {
    url: String,
    records: Vec<ExtractedRecord>,
    skipped: Option<SkippedItem>,
}

impl PageOutcome {
    fn skipped(url: &str, reason: impl Into<String>) -> Self {
        let skipped = SkippedItem::new(url, reason);
        warn!(url = %skipped.url, reason = %skipped.reason, "skipped page");
        Self {
            url: url.to_string(),
            records: Vec::new(),
            skipped: Some(skipped),
        }
    }
}

/// Schema-driven LLM extraction with a grounding check per datapoint.
pub struct DataExtractor {
    model: Arc<dyn CompletionModel>,
    ocr: Option<Arc<dyn OcrProvider>>,
}

impl DataExtractor {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model, ocr: None }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrProvider>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub async fn extract(
        &self,
        pages: Vec<WebPage>,
        schema: &ExtractionSchema,
        config: &ExtractionConfig,
    ) -> Result<ExtractionReport, CollectError> {
        self.check_config(schema, config)?;
        let page_count = pages.len();

        let outcomes = futures_stream::iter(pages)
            .map(|page| self.extract_page(page, schema, config))
            .buffered(config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut report = ExtractionReport::default();
        for outcome in outcomes {
            for mut record in outcome.records {
                record.id = report.records.len() + 1;
                report.records.push(record);
            }
            report.skipped.extend(outcome.skipped);
        }

        info!(
            pages = page_count,
            records = report.records.len(),
            grounded = report.records.iter().filter(|record| record.is_grounded).count(),
            skipped = report.skipped.len(),
            "extraction finished"
        );
        Ok(report)
    }

    /// Fetches `urls` and extracts from them; failed fetches are skipped.
    /// PDF urls are not downloaded when PDF handling is off.
    pub async fn extract_urls<F>(
        &self,
        fetcher: &F,
        urls: &[String],
        schema: &ExtractionSchema,
        config: &ExtractionConfig,
    ) -> Result<ExtractionReport, CollectError>
    where
        F: PageFetcher + ?Sized,
    {
        self.check_config(schema, config)?;

        let fetched = futures_stream::iter(urls)
            .map(|url| async move {
                if !config.handle_pdfs && looks_like_pdf_url(url) {
                    return Err(SkippedItem::new(url.clone(), "pdf handling is disabled"));
                }
                match fetcher.fetch(url).await {
                    Ok(content) => {
                        let mut page = page_from_fetched(content, None);
                        page.url = url.clone();
                        Ok(page)
                    }
                    Err(error) => Err(SkippedItem::new(url.clone(), error.to_string())),
                }
            })
            .buffered(config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut pages = Vec::new();
        let mut skipped = Vec::new();
        for outcome in fetched {
            match outcome {
                Ok(page) => pages.push(page),
                Err(item) => {
                    warn!(url = %item.url, reason = %item.reason, "skipped url");
                    skipped.push(item);
                }
            }
        }

        let mut report = self.extract(pages, schema, config).await?;
        skipped.append(&mut report.skipped);
        report.skipped = skipped;
        Ok(report)
    }

    /// Yields records as pages finish, then a `PageDone` event per page.
    pub fn extract_stream<'a>(
        &'a self,
        pages: Vec<WebPage>,
        schema: &'a ExtractionSchema,
        config: &'a ExtractionConfig,
    ) -> Pin<Box<dyn Stream<Item = Result<ExtractionEvent, CollectError>> + Send + 'a>> {
        Box::pin(stream! {
            if let Err(error) = self.check_config(schema, config) {
                yield Err(error);
                return;
            }

            let mut outcomes = futures_stream::iter(pages)
                .map(|page| self.extract_page(page, schema, config))
                .buffered(config.concurrency.max(1));

            let mut next_id = 1;
            while let Some(outcome) = outcomes.next().await {
                let records = outcome.records.len();
                for mut record in outcome.records {
                    record.id = next_id;
                    next_id += 1;
                    yield Ok(ExtractionEvent::Record(record));
                }
                if let Some(skipped) = outcome.skipped {
                    yield Ok(ExtractionEvent::Skipped(skipped));
                }
                yield Ok(ExtractionEvent::PageDone { url: outcome.url, records });
            }
        })
    }

    fn check_config(&self, schema: &ExtractionSchema, config: &ExtractionConfig) -> Result<(), CollectError> {
        if config.handle_pdfs && self.ocr.is_none() {
            return Err(ConfigError::MissingOcrProvider.into());
        }
        if schema.fields.is_empty() {
            return Err(CollectError::InvalidArgument(format!(
                "extraction schema '{}' has no fields",
                schema.name
            )));
        }
        Ok(())
    }

    async fn extract_page(
        &self,
        mut page: WebPage,
        schema: &ExtractionSchema,
        config: &ExtractionConfig,
    ) -> PageOutcome {
        if page.kind == ContentKind::Pdf {
            if !config.handle_pdfs {
                return PageOutcome::skipped(&page.url, "pdf handling is disabled");
            }
            if let Err(reason) = self.read_pdf(&mut page).await {
                return PageOutcome::skipped(&page.url, reason);
            }
        }

        if page.text.trim().is_empty() {
            return PageOutcome::skipped(&page.url, "page has no text");
        }

        let schema_json = match serde_json::to_string_pretty(&schema.to_json_schema()) {
            Ok(rendered) => rendered,
            Err(error) => return PageOutcome::skipped(&page.url, error.to_string()),
        };
        let prompt = prompts::render(
            prompts::EXTRACT_DATA,
            &[
                ("schema_name", schema.name.as_str()),
                (
                    "extra_instruction",
                    config.extra_instruction.as_deref().unwrap_or_default(),
                ),
                ("json_schema", schema_json.as_str()),
                ("url", page.url.as_str()),
                ("content", truncate_chars(&page.text, config.max_page_chars)),
            ],
        );

        let reply = match self.model.complete(&prompt).await {
            Ok(reply) => reply,
            Err(error) => return PageOutcome::skipped(&page.url, error.to_string()),
        };
        let datapoints = match parse_datapoints(&reply, schema) {
            Ok(datapoints) => datapoints,
            Err(error) => return PageOutcome::skipped(&page.url, error.to_string()),
        };

        let mut records = Vec::with_capacity(datapoints.len());
        for datapoint in datapoints {
            match build_record(&page, datapoint) {
                Ok(record) => records.push(record),
                Err(error) => return PageOutcome::skipped(&page.url, error.to_string()),
            }
        }

        debug!(url = %page.url, records = records.len(), ocr = page.ocr, "page extracted");
        PageOutcome {
            url: page.url,
            records,
            skipped: None,
        }
    }

    /// Fills `page.text` from OCR, falling back to the PDF text layer.
    async fn read_pdf(&self, page: &mut WebPage) -> Result<(), String> {
        let Some(ocr) = &self.ocr else {
            return Err(ConfigError::MissingOcrProvider.to_string());
        };

        let content = (!page.content.is_empty()).then_some(page.content.as_slice());
        let ocr_error = match ocr.recognize_pdf(&page.url, content).await {
            Ok(text) if !text.trim().is_empty() => {
                page.text = text;
                page.ocr = true;
                return Ok(());
            }
            Ok(_) => "ocr returned no text".to_string(),
            Err(error) => error.to_string(),
        };

        warn!(url = %page.url, error = %ocr_error, "ocr failed, reading pdf text layer");
        match pdf_text_layer(&page.content) {
            Ok(text) => {
                page.text = text;
                Ok(())
            }
            Err(error) => Err(format!("pdf is unextractable: {ocr_error}; {error}")),
        }
    }
}

/// One datapoint: schema field values plus the model's grounding quote.
#[derive(Debug, PartialEq)]
struct Datapoint {
    fields: Map<String, Value>,
    quote: Option<String>,
}

fn parse_datapoints(reply: &str, schema: &ExtractionSchema) -> Result<Vec<Datapoint>, CollectError> {
    let cleaned = strip_code_fences(reply);
    let parsed: Value = serde_json::from_str(&cleaned).map_err(|error| {
        CollectError::MalformedResponse(format!("extraction reply is not JSON: {error}"))
    })?;

    let items = match parsed {
        Value::Array(items) => items,
        Value::Object(mut object) => {
            match WRAPPER_KEYS
                .iter()
                .find(|key| object.get(**key).is_some_and(Value::is_array))
            {
                Some(key) => match object.remove(*key) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                },
                None => vec![Value::Object(object)],
            }
        }
        other => {
            return Err(CollectError::MalformedResponse(format!(
                "expected a JSON array of datapoints, got {other}"
            )))
        }
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(object) => Some(object),
            _ => None,
        })
        .filter(|object| !object.get("error").is_some_and(is_truthy))
        .map(|object| Datapoint {
            fields: schema
                .fields
                .iter()
                .map(|field| {
                    let value = object.get(&field.name).cloned().unwrap_or(Value::Null);
                    (field.name.clone(), value)
                })
                .collect(),
            quote: object
                .get(ExtractionSchema::GROUNDING_FIELD)
                .and_then(Value::as_str)
                .map(str::to_string),
        })
        .collect())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|float| float != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(object) => !object.is_empty(),
    }
}

fn build_record(page: &WebPage, datapoint: Datapoint) -> Result<ExtractedRecord, CollectError> {
    let report = check_grounding(&datapoint.fields, datapoint.quote.as_deref(), &page.text)?;
    let source = match (&datapoint.quote, report.is_grounded) {
        (Some(quote), true) => citation_url(&page.url, quote),
        _ => page.url.clone(),
    };

    Ok(ExtractedRecord {
        id: 0,
        url: page.url.clone(),
        fields: datapoint.fields,
        grounding_quote: datapoint.quote,
        is_grounded: report.is_grounded,
        field_grounding: report.fields,
        source,
        flags: Vec::new(),
    })
}

/// Asks the model to design a typed schema with one field per name in
/// `fields`.
pub async fn generate_extraction_schema(
    model: &dyn CompletionModel,
    dataset_description: &str,
    fields: &[String],
) -> Result<ExtractionSchema, CollectError> {
    if fields.is_empty() {
        return Err(CollectError::InvalidArgument(
            "at least one field is needed to design a schema".to_string(),
        ));
    }

    let field_list = fields.join(", ");
    let prompt = prompts::render(
        prompts::GENERATE_EXTRACTION_SCHEMA,
        &[
            ("schema_fields", field_list.as_str()),
            ("dataset_description", dataset_description),
        ],
    );
    let reply = model.complete(&prompt).await?;

    let schema: ExtractionSchema = serde_json::from_str(&strip_code_fences(&reply)).map_err(|error| {
        CollectError::MalformedResponse(format!("extraction schema reply: {error}"))
    })?;
    if schema.fields.is_empty() {
        return Err(CollectError::MalformedResponse(
            "extraction schema has no fields".to_string(),
        ));
    }

    let designed = schema
        .fields
        .iter()
        .map(|field| field.name.to_lowercase())
        .collect::<Vec<_>>();
    let missing = fields
        .iter()
        .filter(|name| !designed.contains(&name.trim().to_lowercase().replace(' ', "_")))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        warn!(?missing, "schema does not cover every requested field");
    }

    debug!(name = %schema.name, fields = schema.fields.len(), "designed extraction schema");
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldKind, SearchResult};
    use crate::testing::{FakeCompletion, FakeFetcher, FakeOcr};
    use futures::TryStreamExt;
    use serde_json::json;

    const PAGE_TEXT: &str = "Acme Corp reported annual revenue of 52,000,000 dollars in 2023. The company employs 300 people.";

    fn schema() -> ExtractionSchema {
        ExtractionSchema::new("CompanyRevenue")
            .field("company", FieldKind::String, "Company name")
            .field("revenue", FieldKind::Number, "Annual revenue in USD")
    }

    fn html_page(url: &str, text: &str) -> WebPage {
        WebPage {
            url: url.to_string(),
            content: Vec::new(),
            kind: ContentKind::Html,
            title: None,
            text: text.to_string(),
            ocr: false,
            result: None::<SearchResult>,
        }
    }

    fn pdf_page(url: &str, bytes: &[u8]) -> WebPage {
        WebPage {
            content: bytes.to_vec(),
            kind: ContentKind::Pdf,
            text: String::new(),
            ..html_page(url, "")
        }
    }

    #[tokio::test]
    async fn verbatim_values_are_grounded_and_cited() {
        let model = FakeCompletion::new().reply(
            "https://acme.com/report",
            r#"[{"company": "Acme Corp", "revenue": 52000000, "grounding_quote": "annual revenue of 52,000,000 dollars"}]"#,
        );
        let extractor = DataExtractor::new(Arc::new(model));

        let report = extractor
            .extract(
                vec![html_page("https://acme.com/report", PAGE_TEXT)],
                &schema(),
                &ExtractionConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.records.len(), 1);
        let record = &report.records[0];
        assert_eq!(record.id, 1);
        assert!(record.is_grounded);
        assert_eq!(record.fields["revenue"], json!(52000000));
        assert_eq!(record.field_grounding["company"].confidence, 1.0);
        assert!(record
            .source
            .starts_with("https://acme.com/report#:~:text=annual%20revenue"));
    }

    #[tokio::test]
    async fn fabricated_values_are_not_grounded() {
        let model = FakeCompletion::new().reply(
            "Page content",
            r#"[{"company": "Globex", "revenue": 7, "grounding_quote": "Globex revenue was 7 dollars"}]"#,
        );
        let extractor = DataExtractor::new(Arc::new(model));

        let report = extractor
            .extract(
                vec![html_page("https://acme.com/report", PAGE_TEXT)],
                &schema(),
                &ExtractionConfig::default(),
            )
            .await
            .unwrap();

        let record = &report.records[0];
        assert!(!record.is_grounded);
        assert!(!record.field_grounding["company"].grounded);
        assert_eq!(record.field_grounding["revenue"].confidence, 0.0);
        assert_eq!(record.source, "https://acme.com/report");
    }

    #[test]
    fn wrapped_datapoints_drop_errors_and_unknown_fields() {
        let reply = r#"```json
        {"items": [
            {"company": "Acme", "revenue": 1, "ceo": "Jane", "grounding_quote": "Acme"},
            {"error": "no data on page"},
            {"company": "Initech", "error": false}
        ]}
        ```"#;

        let datapoints = parse_datapoints(reply, &schema()).unwrap();
        assert_eq!(datapoints.len(), 2);
        assert_eq!(datapoints[0].fields.len(), 2);
        assert!(datapoints[0].fields.get("ceo").is_none());
        assert_eq!(datapoints[0].quote.as_deref(), Some("Acme"));
        assert_eq!(datapoints[1].fields["revenue"], Value::Null);
    }

    #[test]
    fn non_json_reply_is_malformed() {
        assert!(matches!(
            parse_datapoints("I could not find anything.", &schema()),
            Err(CollectError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn pdfs_are_skipped_without_pdf_handling() {
        let extractor = DataExtractor::new(Arc::new(FakeCompletion::new()));
        let report = extractor
            .extract(
                vec![pdf_page("https://a.com/x.pdf", b"%PDF-1.4")],
                &schema(),
                &ExtractionConfig::default(),
            )
            .await
            .unwrap();

        assert!(report.records.is_empty());
        assert_eq!(report.skipped[0].reason, "pdf handling is disabled");
    }

    #[tokio::test]
    async fn pdf_handling_requires_ocr_provider() {
        let extractor = DataExtractor::new(Arc::new(FakeCompletion::new()));
        let config = ExtractionConfig {
            handle_pdfs: true,
            ..Default::default()
        };
        let result = extractor.extract(Vec::new(), &schema(), &config).await;
        assert!(matches!(
            result,
            Err(CollectError::Config(ConfigError::MissingOcrProvider))
        ));
    }

    #[tokio::test]
    async fn ocr_text_is_extracted() {
        let model = FakeCompletion::new().reply(
            "Page content",
            r#"[{"company": "Acme Corp", "revenue": 52000000, "grounding_quote": "Acme Corp reported annual revenue"}]"#,
        );
        let extractor =
            DataExtractor::new(Arc::new(model)).with_ocr(Arc::new(FakeOcr::with_text(PAGE_TEXT)));
        let config = ExtractionConfig {
            handle_pdfs: true,
            ..Default::default()
        };

        let report = extractor
            .extract(vec![pdf_page("https://a.com/x.pdf", b"%PDF-1.4")], &schema(), &config)
            .await
            .unwrap();

        assert_eq!(report.records.len(), 1);
        assert!(report.records[0].is_grounded);
    }

    #[tokio::test]
    async fn unreadable_pdf_after_failed_ocr_is_skipped() {
        let extractor = DataExtractor::new(Arc::new(FakeCompletion::new()))
            .with_ocr(Arc::new(FakeOcr::failing()));
        let config = ExtractionConfig {
            handle_pdfs: true,
            ..Default::default()
        };

        let report = extractor
            .extract(vec![pdf_page("https://a.com/x.pdf", b"not a pdf")], &schema(), &config)
            .await
            .unwrap();

        assert!(report.records.is_empty());
        assert!(report.skipped[0].reason.starts_with("pdf is unextractable"));
    }

    #[tokio::test]
    async fn failed_llm_call_skips_only_that_page() {
        let model = FakeCompletion::new().reply(
            "https://good.com",
            r#"[{"company": "Acme Corp", "revenue": 1, "grounding_quote": "Acme Corp"}]"#,
        );
        let extractor = DataExtractor::new(Arc::new(model));

        let report = extractor
            .extract(
                vec![
                    html_page("https://bad.com", PAGE_TEXT),
                    html_page("https://good.com", PAGE_TEXT),
                ],
                &schema(),
                &ExtractionConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].url, "https://good.com");
        assert_eq!(report.skipped[0].url, "https://bad.com");
    }

    #[tokio::test]
    async fn urls_are_fetched_before_extraction() {
        let model = FakeCompletion::new().reply(
            "Page content",
            r#"[{"company": "Acme Corp", "revenue": 1, "grounding_quote": "Acme Corp"}]"#,
        );
        let fetcher = FakeFetcher::new().html(
            "https://acme.com",
            &format!("<html><body><p>{PAGE_TEXT}</p><script>var x = 1;</script></body></html>"),
        );
        let extractor = DataExtractor::new(Arc::new(model));

        let report = extractor
            .extract_urls(
                &fetcher,
                &["https://acme.com".to_string(), "https://missing.com".to_string()],
                &schema(),
                &ExtractionConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].url, "https://missing.com");
    }

    #[tokio::test]
    async fn pdf_urls_are_not_downloaded_without_pdf_handling() {
        let model = FakeCompletion::new().reply(
            "Page content",
            r#"[{"company": "Acme Corp", "revenue": 1, "grounding_quote": "Acme Corp"}]"#,
        );
        let fetcher = FakeFetcher::new()
            .pdf("https://acme.com/annual-report.pdf", b"%PDF-1.4 ...")
            .html("https://acme.com", &format!("<p>{PAGE_TEXT}</p>"));
        let extractor = DataExtractor::new(Arc::new(model));

        let report = extractor
            .extract_urls(
                &fetcher,
                &[
                    "https://acme.com/annual-report.pdf".to_string(),
                    "https://acme.com".to_string(),
                ],
                &schema(),
                &ExtractionConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(fetcher.fetched(), vec!["https://acme.com"]);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].url, "https://acme.com/annual-report.pdf");
        assert_eq!(report.skipped[0].reason, "pdf handling is disabled");
    }

    #[tokio::test]
    async fn stream_emits_records_then_page_done() {
        let model = FakeCompletion::new().reply(
            "Page content",
            r#"[{"company": "Acme Corp", "revenue": 1, "grounding_quote": "Acme Corp"}, {"company": "Acme Corp", "revenue": 2, "grounding_quote": "Acme Corp"}]"#,
        );
        let extractor = DataExtractor::new(Arc::new(model));
        let schema = schema();
        let config = ExtractionConfig::default();

        let events = extractor
            .extract_stream(vec![html_page("https://acme.com", PAGE_TEXT)], &schema, &config)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], ExtractionEvent::Record(record) if record.id == 2));
        assert!(matches!(
            &events[2],
            ExtractionEvent::PageDone { url, records: 2 } if url == "https://acme.com"
        ));
    }

    #[tokio::test]
    async fn schema_is_designed_from_field_names() {
        let model = FakeCompletion::new().reply(
            "Design an extraction schema",
            r#"```json
            {"name": "CompanyRevenue", "fields": [
                {"name": "company", "type": "string", "description": "Company name"},
                {"name": "revenue", "type": "number", "description": "Revenue in USD"}
            ]}
            ```"#,
        );

        let schema = generate_extraction_schema(
            &model,
            "top tech companies by revenue",
            &["company".to_string(), "revenue".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(schema.name, "CompanyRevenue");
        assert_eq!(schema.get("revenue").unwrap().kind, FieldKind::Number);
    }
}
