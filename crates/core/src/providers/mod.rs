pub mod bright_data;
pub mod http;
pub mod jina;
pub mod mistral;
pub mod openai;

pub use bright_data::BrightDataSearch;
pub use http::HttpFetcher;
pub use jina::JinaReranker;
pub use mistral::MistralOcr;
pub use openai::OpenAiCompletion;

/// Response body for error reports, bounded so provider pages do not flood logs.
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body = crate::content::truncate_chars(body.trim(), 500);
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    }
}
