use crate::error::CollectError;
use crate::models::FetchedContent;
use crate::traits::PageFetcher;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Plain HTTP GET of page content.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CollectError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, CollectError> {
        debug!(url, "fetching page");

        let response = self.client.get(url).send().await.map_err(|error| {
            if error.is_timeout() {
                CollectError::Timeout(url.to_string())
            } else {
                CollectError::Http(error)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectError::provider(url, format!("http status {status}")));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await.map_err(|error| {
            if error.is_timeout() {
                CollectError::Timeout(url.to_string())
            } else {
                CollectError::Http(error)
            }
        })?;

        Ok(FetchedContent {
            url: final_url,
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}
