use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid value for {name}: {details}")]
    InvalidValue { name: String, details: String },

    #[error("unknown geolocation country: {0}")]
    UnknownCountry(String),

    #[error("no source catalog entry for: {0}")]
    UnknownSourceCollection(String),

    #[error("pdf handling is enabled but no OCR provider is configured")]
    MissingOcrProvider,

    #[error("countries must be assigned either globally or per variable value, not both")]
    ConflictingCountryAssignment,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid response from {provider}: {details}")]
    Provider { provider: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed llm output: {0}")]
    MalformedResponse(String),

    #[error("ocr failed: {0}")]
    Ocr(String),

    #[error("pdf parse error: {0}")]
    Pdf(String),

    #[error("invalid date: {0}")]
    Date(#[from] chrono::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("request timed out: {0}")]
    Timeout(String),
}

impl CollectError {
    pub fn provider(provider: &str, details: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.to_string(),
            details: details.into(),
        }
    }
}

pub type Result<T, E = CollectError> = std::result::Result<T, E>;
