//! Typed configuration for every provider and pipeline stage.
//!
//! Provider configs can be read from the environment with `from_env`; stage
//! configs carry documented defaults through `Default`.

use crate::error::ConfigError;
use crate::models::DateRange;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_LLM_MODEL: &str = "openai/gpt-4.1";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_BRIGHT_DATA_URL: &str = "https://api.brightdata.com/request";
pub const DEFAULT_MISTRAL_URL: &str = "https://api.mistral.ai";
pub const DEFAULT_MISTRAL_OCR_MODEL: &str = "mistral-ocr-latest";
pub const DEFAULT_JINA_URL: &str = "https://api.jina.ai/v1/rerank";
pub const DEFAULT_JINA_MODEL: &str = "jina-reranker-v2-base-multilingual";

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let value = value.trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

pub(crate) fn required_env(name: &str) -> Result<String, ConfigError> {
    env_var(name).ok_or_else(|| ConfigError::MissingEnv(name.to_string()))
}

fn require_key(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            details: "api key is empty".to_string(),
        });
    }
    Ok(())
}

/// Chat-completion provider settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Model identifier, optionally prefixed with its provider (`openai/gpt-4.1`).
    pub model: String,
    pub api_key: String,
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Sampling temperature; `None` leaves the provider default.
    pub temperature: Option<f32>,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LLM_MODEL.to_string(),
            api_key: String::new(),
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            temperature: Some(0.2),
            timeout: Duration::from_secs(120),
        }
    }
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Reads `LLM_API_KEY` (or `OPENAI_API_KEY`), `LLM_MODEL`, `LLM_BASE_URL`
    /// and `LLM_TEMPERATURE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env_var("LLM_API_KEY")
            .or_else(|| env_var("OPENAI_API_KEY"))
            .ok_or_else(|| ConfigError::MissingEnv("LLM_API_KEY".to_string()))?;

        let mut config = Self::new(api_key);
        if let Some(model) = env_var("LLM_MODEL") {
            config.model = model;
        }
        if let Some(base_url) = env_var("LLM_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(raw) = env_var("LLM_TEMPERATURE") {
            let temperature = raw.parse::<f32>().map_err(|error| ConfigError::InvalidValue {
                name: "LLM_TEMPERATURE".to_string(),
                details: error.to_string(),
            })?;
            config.temperature = Some(temperature);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_key("llm api key", &self.api_key)
    }

    /// Model name as sent on the wire; an `openai/` routing prefix is dropped.
    pub fn model_name(&self) -> &str {
        self.model.strip_prefix("openai/").unwrap_or(&self.model)
    }
}

/// Bright Data SERP API settings.
#[derive(Debug, Clone)]
pub struct BrightDataConfig {
    pub api_key: String,
    pub zone: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl BrightDataConfig {
    pub fn new(api_key: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            zone: zone.into(),
            base_url: DEFAULT_BRIGHT_DATA_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            required_env("BRIGHT_DATA_API_KEY")?,
            required_env("BRIGHT_DATA_ZONE")?,
        );
        if let Some(base_url) = env_var("BRIGHT_DATA_BASE_URL") {
            config.base_url = base_url;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_key("bright data api key", &self.api_key)?;
        if self.zone.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "bright data zone".to_string(),
                details: "zone is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Mistral OCR API settings.
#[derive(Debug, Clone)]
pub struct MistralOcrConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl MistralOcrConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MISTRAL_OCR_MODEL.to_string(),
            base_url: DEFAULT_MISTRAL_URL.to_string(),
            timeout: Duration::from_secs(180),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(required_env("MISTRAL_API_KEY")?))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_key("mistral api key", &self.api_key)
    }
}

/// Jina rerank API settings.
#[derive(Debug, Clone)]
pub struct JinaConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl JinaConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_JINA_MODEL.to_string(),
            base_url: DEFAULT_JINA_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(required_env("JINA_API_KEY")?);
        if let Some(model) = env_var("JINA_RERANK_MODEL") {
            config.model = model;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_key("jina api key", &self.api_key)
    }
}

/// Country filters assigned per value of one query variable.
///
/// A query instantiated with `variable = value` searches with the geolocation
/// and/or source list mapped to `value`, instead of the global filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountryAssignment {
    pub variable: String,
    #[serde(default)]
    pub geolocation: HashMap<String, String>,
    #[serde(default)]
    pub sources: HashMap<String, Vec<String>>,
}

impl CountryAssignment {
    /// Assignment of geolocation countries to the values of `variable`.
    pub fn geolocation<I, K, V>(variable: &str, countries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            variable: variable.to_string(),
            geolocation: countries
                .into_iter()
                .map(|(value, country)| (value.into(), country.into()))
                .collect(),
            sources: Default::default(),
        }
    }

    /// Restricts searches for `value` to `sites`.
    pub fn with_sources<I, S>(mut self, value: &str, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources
            .insert(value.to_string(), sites.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub date_range: DateRange,
    /// Split `date_range` into sub-ranges of at most a year.
    pub time_chunking: bool,
    /// Country name, resolved to a search geolocation code.
    pub geolocation_country: Option<String>,
    pub news_only: bool,
    /// Restrict results to these sites (`site:` filters, first 50 are used).
    pub source_allow_list: Vec<String>,
    pub per_value_countries: Option<CountryAssignment>,
    pub rerank: bool,
    /// Results kept per query after reranking.
    pub rerank_top_n: usize,
    /// Result pages requested per query and date chunk, 20 results each.
    pub results_pages_per_query: u32,
    pub search_concurrency: usize,
    /// Fetch page content for the kept results.
    pub fetch_pages: bool,
    pub fetch_concurrency: usize,
    pub fetch_timeout: Duration,
    /// Fill missing publication dates from the fetched HTML.
    pub lookup_publication_dates: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            date_range: DateRange::default(),
            time_chunking: false,
            geolocation_country: None,
            news_only: false,
            source_allow_list: Vec::new(),
            per_value_countries: None,
            rerank: false,
            rerank_top_n: 10,
            results_pages_per_query: 1,
            search_concurrency: 4,
            fetch_pages: true,
            fetch_concurrency: 8,
            fetch_timeout: Duration::from_secs(30),
            lookup_publication_dates: false,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(assignment) = &self.per_value_countries {
            let global = self.geolocation_country.is_some() || !self.source_allow_list.is_empty();
            let per_value = !assignment.geolocation.is_empty() || !assignment.sources.is_empty();
            if global && per_value {
                return Err(ConfigError::ConflictingCountryAssignment);
            }
        }
        if self.results_pages_per_query == 0 {
            return Err(ConfigError::InvalidValue {
                name: "results_pages_per_query".to_string(),
                details: "must be at least 1".to_string(),
            });
        }
        if self.rerank && self.rerank_top_n == 0 {
            return Err(ConfigError::InvalidValue {
                name: "rerank_top_n".to_string(),
                details: "must be at least 1 when reranking".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Appended to the extraction instruction.
    pub extra_instruction: Option<String>,
    /// Run PDFs through OCR; when off, PDFs are skipped.
    pub handle_pdfs: bool,
    pub concurrency: usize,
    /// Page text beyond this many characters is not sent to the model.
    pub max_page_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            extra_instruction: None,
            handle_pdfs: false,
            concurrency: 4,
            max_page_chars: 100_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_name_drops_openai_prefix_only() {
        let mut config = LlmConfig::new("key");
        assert_eq!(config.model_name(), "gpt-4.1");

        config.model = "anthropic/claude-sonnet".to_string();
        assert_eq!(config.model_name(), "anthropic/claude-sonnet");
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(LlmConfig::default().validate().is_err());
        assert!(BrightDataConfig::new("key", " ").validate().is_err());
        assert!(JinaConfig::new("key").validate().is_ok());
    }

    #[test]
    fn global_and_per_value_countries_conflict() {
        let mut assignment = CountryAssignment {
            variable: "country".to_string(),
            ..Default::default()
        };
        assignment
            .geolocation
            .insert("Kenya".to_string(), "Kenya".to_string());

        let config = RetrievalConfig {
            geolocation_country: Some("France".to_string()),
            per_value_countries: Some(assignment),
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ConflictingCountryAssignment)
        ));
    }

    #[test]
    fn global_sources_and_per_value_sources_conflict() {
        let config = RetrievalConfig {
            source_allow_list: vec!["reuters.com".to_string()],
            per_value_countries: Some(
                CountryAssignment::geolocation("country", Vec::<(String, String)>::new())
                    .with_sources("Kenya", ["nation.africa"]),
            ),
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ConflictingCountryAssignment)
        ));
    }
}
