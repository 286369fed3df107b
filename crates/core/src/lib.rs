pub mod chunking;
pub mod config;
pub mod content;
pub mod error;
pub mod extraction;
pub mod geo;
pub mod grounding;
pub mod models;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod quality;
pub mod query;
pub mod rerank;
pub mod retrieval;
pub mod template;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use chunking::{date_chunks, split_date_range, MAX_DAYS_PER_CHUNK};
pub use config::{
    BrightDataConfig, CountryAssignment, ExtractionConfig, JinaConfig, LlmConfig,
    MistralOcrConfig, RetrievalConfig,
};
pub use error::{CollectError, ConfigError};
pub use extraction::{generate_extraction_schema, DataExtractor, ExtractionEvent, ExtractionReport};
pub use geo::{country_code, geolocation_countries, SourceCatalog};
pub use grounding::{check_grounding, citation_url, GroundingReport};
pub use models::{
    ContentKind, DateRange, ExtractedRecord, ExtractionSchema, FetchedContent, FieldGrounding,
    FieldKind, QualityFlag, SchemaField, SearchRequest, SearchResult, Severity, SkippedItem,
    VariableBinding, Variables, WebPage,
};
pub use pipeline::{Pipeline, PipelineOutput, PipelineRequest};
pub use providers::{BrightDataSearch, HttpFetcher, JinaReranker, MistralOcr, OpenAiCompletion};
pub use quality::QualityController;
pub use query::generate_search_queries;
pub use rerank::{rerank_results, CharacterNgramReranker};
pub use retrieval::{PageRetriever, RetrievalReport};
pub use template::{expand_templates, normalize_variables, ExpandedQuery, QueryTemplate};
pub use traits::{CompletionModel, OcrProvider, PageFetcher, Reranker, SearchProvider};
