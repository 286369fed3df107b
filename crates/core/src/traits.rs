use crate::error::CollectError;
use crate::models::{FetchedContent, SearchRequest, SearchResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Single-prompt text completion.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CollectError>;
}

/// Web search returning one page of results per request.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>, CollectError>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, CollectError>;
}

/// Text recognition for PDF documents.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Returns the recognized text of every page. `content` is the document
    /// body when it was already downloaded.
    async fn recognize_pdf(&self, url: &str, content: Option<&[u8]>) -> Result<String, CollectError>;
}

/// Relevance scoring of (query, document) pairs.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// One score per pair; `queries` and `documents` have equal length.
    async fn score(&self, queries: &[String], documents: &[String]) -> Result<Vec<f64>, CollectError>;
}

#[async_trait]
impl<T: CompletionModel + ?Sized> CompletionModel for Arc<T> {
    async fn complete(&self, prompt: &str) -> Result<String, CollectError> {
        (**self).complete(prompt).await
    }
}

#[async_trait]
impl<T: PageFetcher + ?Sized> PageFetcher for Arc<T> {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, CollectError> {
        (**self).fetch(url).await
    }
}

#[async_trait]
impl<T: SearchProvider + ?Sized> SearchProvider for Arc<T> {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>, CollectError> {
        (**self).search(request).await
    }
}

pub(crate) fn ensure_parallel(queries: &[String], documents: &[String]) -> Result<(), CollectError> {
    if queries.len() != documents.len() {
        return Err(CollectError::InvalidArgument(format!(
            "got {} queries for {} documents",
            queries.len(),
            documents.len()
        )));
    }
    Ok(())
}
