//! In-memory provider fakes shared by the unit tests.

use crate::error::CollectError;
use crate::models::{FetchedContent, SearchRequest, SearchResult};
use crate::traits::{CompletionModel, OcrProvider, PageFetcher, SearchProvider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Answers with the reply of the first rule whose needle the prompt contains.
#[derive(Default)]
pub struct FakeCompletion {
    rules: Vec<(String, String)>,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.to_string(), reply.to_string()));
        self
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionModel for FakeCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, CollectError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .ok_or_else(|| CollectError::provider("fake", "no reply configured"))
    }
}

/// Returns canned results for every request whose search text contains a
/// key, and records each request.
#[derive(Default)]
pub struct FakeSearch {
    results: Vec<(String, Vec<(String, String)>)>,
    pub requests: Mutex<Vec<SearchRequest>>,
}

impl FakeSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests containing `needle` return `(url, title)` pairs.
    pub fn results(mut self, needle: &str, hits: &[(&str, &str)]) -> Self {
        self.results.push((
            needle.to_string(),
            hits.iter()
                .map(|(url, title)| (url.to_string(), title.to_string()))
                .collect(),
        ));
        self
    }

    pub fn recorded(&self) -> Vec<SearchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>, CollectError> {
        self.requests.lock().unwrap().push(request.clone());
        let text = request.search_text();
        Ok(self
            .results
            .iter()
            .filter(|(needle, _)| text.contains(needle.as_str()))
            .flat_map(|(_, hits)| hits.iter())
            .map(|(url, title)| SearchResult {
                url: url.clone(),
                title: title.clone(),
                snippet: String::new(),
                published: None,
                source: None,
                country: request.country.clone(),
                query: request.query.clone(),
                binding: request.binding.clone(),
                score: None,
            })
            .collect())
    }
}

/// Serves fixed bodies per url; unknown urls fail and slow urls sleep first.
#[derive(Default)]
pub struct FakeFetcher {
    pages: HashMap<String, (String, Vec<u8>)>,
    delays: HashMap<String, Duration>,
    pub fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn html(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(
            url.to_string(),
            ("text/html; charset=utf-8".to_string(), body.as_bytes().to_vec()),
        );
        self
    }

    pub fn pdf(mut self, url: &str, body: &[u8]) -> Self {
        self.pages
            .insert(url.to_string(), ("application/pdf".to_string(), body.to_vec()));
        self
    }

    pub fn slow(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, CollectError> {
        self.fetched.lock().unwrap().push(url.to_string());
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        let (content_type, bytes) = self
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| CollectError::provider(url, "http status 404 Not Found"))?;
        Ok(FetchedContent {
            url: url.to_string(),
            content_type: Some(content_type),
            bytes,
        })
    }
}

/// OCR that returns fixed text, or fails when built with `failing`.
pub struct FakeOcr {
    text: Option<String>,
}

impl FakeOcr {
    pub fn with_text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { text: None }
    }
}

#[async_trait]
impl OcrProvider for FakeOcr {
    async fn recognize_pdf(&self, url: &str, _content: Option<&[u8]>) -> Result<String, CollectError> {
        self.text
            .clone()
            .ok_or_else(|| CollectError::Ocr(format!("ocr unavailable for {url}")))
    }
}
