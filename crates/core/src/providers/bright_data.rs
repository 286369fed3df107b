use crate::config::BrightDataConfig;
use crate::error::CollectError;
use crate::models::{SearchRequest, SearchResult};
use crate::providers::error_body;
use crate::traits::SearchProvider;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const PROVIDER: &str = "bright_data";

/// Results per Google results page.
pub const RESULTS_PER_PAGE: u32 = 20;

#[derive(Debug, Default, Deserialize)]
struct SerpResponse {
    #[serde(default)]
    organic: Vec<SerpItem>,
    #[serde(default)]
    news: Vec<SerpItem>,
}

#[derive(Debug, Default, Deserialize)]
struct SerpItem {
    #[serde(default)]
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

/// Google search through the Bright Data SERP API.
pub struct BrightDataSearch {
    client: Client,
    config: BrightDataConfig,
}

impl BrightDataSearch {
    pub fn new(config: BrightDataConfig) -> Result<Self, CollectError> {
        config.validate()?;
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

/// Google results url for one request page, asking for parsed JSON output.
pub fn google_search_url(request: &SearchRequest) -> String {
    let encoded = url::form_urlencoded::byte_serialize(request.search_text().as_bytes())
        .collect::<String>();
    let start = request.page * RESULTS_PER_PAGE;

    let mut search_url = format!(
        "https://www.google.com/search?q={encoded}&start={start}&brd_json=1&num={RESULTS_PER_PAGE}"
    );
    if request.news_only {
        search_url.push_str("&tbm=nws");
    }
    if let Some(code) = &request.country_code {
        search_url.push_str(&format!("&gl={code}"));
    }
    search_url
}

fn parse_serp(payload: SerpResponse, request: &SearchRequest) -> Vec<SearchResult> {
    let items = if request.news_only {
        payload.news
    } else {
        payload.organic
    };

    items
        .into_iter()
        .filter(|item| !item.link.trim().is_empty())
        .map(|item| SearchResult {
            url: item.link,
            title: item.title,
            snippet: item.description,
            published: item
                .date
                .as_deref()
                .and_then(|date| date.get(..10))
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()),
            source: if request.news_only { item.source } else { None },
            country: request.country.clone(),
            query: request.query.clone(),
            binding: request.binding.clone(),
            score: None,
        })
        .collect()
}

#[async_trait]
impl SearchProvider for BrightDataSearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>, CollectError> {
        let search_url = google_search_url(request);
        debug!(query = %request.search_text(), page = request.page, "bright data search");

        let response = self
            .client
            .post(&self.config.base_url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "zone": self.config.zone,
                "url": search_url,
                "format": "raw",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollectError::provider(PROVIDER, error_body(response).await));
        }

        let body = response.text().await?;
        let payload: SerpResponse = serde_json::from_str(&body).map_err(|error| {
            CollectError::provider(PROVIDER, format!("unreadable results page: {error}"))
        })?;

        let results = parse_serp(payload, request);
        debug!(count = results.len(), page = request.page, "bright data results");
        Ok(results)
    }
}
