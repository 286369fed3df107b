use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

/// Candidate values per variable name, keyed by normalized name.
pub type Variables = BTreeMap<String, Vec<String>>;

/// One concrete value per variable, used to instantiate a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct VariableBinding(BTreeMap<String, String>);

impl VariableBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0
            .insert(crate::template::normalize_variable_name(&name.into()), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&crate::template::normalize_variable_name(name))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    /// Parses optional `YYYY-MM-DD` bounds.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> crate::error::Result<Self> {
        let parse = |value: &str| NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d");
        Ok(Self {
            start: start.map(parse).transpose()?,
            end: end.map(parse).transpose()?,
        })
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// One search call: an instantiated query plus the filters it runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub binding: VariableBinding,
    pub date_range: DateRange,
    /// Zero-based result page.
    pub page: u32,
    pub news_only: bool,
    pub country_code: Option<String>,
    pub country: Option<String>,
    pub sites: Vec<String>,
}

impl SearchRequest {
    pub const MAX_SITES: usize = 50;

    /// Final search text with date and site operators appended.
    pub fn search_text(&self) -> String {
        let mut text = self.query.clone();

        let mut date_filters = Vec::new();
        if let Some(start) = self.date_range.start {
            date_filters.push(format!("after:{}", start.format("%Y-%m-%d")));
        }
        if let Some(end) = self.date_range.end {
            date_filters.push(format!("before:{}", end.format("%Y-%m-%d")));
        }
        if !date_filters.is_empty() {
            text = format!("{text} {}", date_filters.join(" "));
        }

        let sites = self
            .sites
            .iter()
            .take(Self::MAX_SITES)
            .map(|site| format!("site:{site}"))
            .collect::<Vec<_>>();
        if !sites.is_empty() {
            text = format!("{text} {}", sites.join(" OR "));
        }

        text
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub published: Option<NaiveDate>,
    /// News outlet, present for news results.
    pub source: Option<String>,
    pub country: Option<String>,
    /// Instantiated query that produced this result.
    pub query: String,
    #[serde(default)]
    pub binding: VariableBinding,
    /// Relevance score, present after reranking.
    pub score: Option<f64>,
}

impl SearchResult {
    /// Text scored against the query when reranking.
    pub fn rerank_document(&self) -> String {
        if self.snippet.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.snippet)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Html,
    Pdf,
    Other,
}

/// Raw response body of a fetched url.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    /// Final url after redirects.
    pub url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPage {
    pub url: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub kind: ContentKind,
    pub title: Option<String>,
    /// Plain text; empty for PDFs until OCR runs.
    pub text: String,
    /// Text was produced by OCR.
    #[serde(default)]
    pub ocr: bool,
    pub result: Option<SearchResult>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl FieldKind {
    pub fn json_type(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (FieldKind::String, Value::String(_)) => true,
            (FieldKind::Boolean, Value::Bool(_)) => true,
            (FieldKind::Number, Value::Number(_)) => true,
            (FieldKind::Integer, Value::Number(number)) => {
                number.is_i64()
                    || number.is_u64()
                    || number.as_f64().is_some_and(|float| float.fract() == 0.0)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub description: String,
}

/// Caller-defined shape of the records to extract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionSchema {
    pub name: String,
    pub fields: Vec<SchemaField>,
}

impl ExtractionSchema {
    pub const GROUNDING_FIELD: &'static str = "grounding_quote";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        kind: FieldKind,
        description: impl Into<String>,
    ) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            kind,
            description: description.into(),
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// JSON schema of one datapoint, including the required grounding quote.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for field in &self.fields {
            properties.insert(
                field.name.clone(),
                serde_json::json!({
                    "type": field.kind.json_type(),
                    "description": field.description,
                }),
            );
            required.push(Value::String(field.name.clone()));
        }

        properties.insert(
            Self::GROUNDING_FIELD.to_string(),
            serde_json::json!({
                "type": "string",
                "description": "Short span of text copied verbatim from the page that the data is taken from (a few words), exactly as it appears, with no words skipped and no added escape characters.",
            }),
        );
        required.push(Value::String(Self::GROUNDING_FIELD.to_string()));

        serde_json::json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldGrounding {
    pub grounded: bool,
    /// 1.0 for a whole-token value match; 0.5 for a boolean whose record
    /// quote matched.
    pub confidence: f32,
    /// Snippet of the source text around the match.
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityFlag {
    pub record_id: usize,
    pub issue: String,
    pub severity: Severity,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub id: usize,
    pub url: String,
    pub fields: Map<String, Value>,
    pub grounding_quote: Option<String>,
    pub is_grounded: bool,
    #[serde(default)]
    pub field_grounding: BTreeMap<String, FieldGrounding>,
    /// Citation url, with a text fragment pointing at the quote when grounded.
    pub source: String,
    #[serde(default)]
    pub flags: Vec<QualityFlag>,
}

/// An item a stage gave up on without failing the batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedItem {
    pub url: String,
    pub reason: String,
}

impl SkippedItem {
    pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reason: reason.into(),
        }
    }
}
