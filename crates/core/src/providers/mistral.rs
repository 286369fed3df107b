use crate::config::MistralOcrConfig;
use crate::error::CollectError;
use crate::providers::error_body;
use crate::traits::OcrProvider;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    model: &'a str,
    document: OcrDocument,
    include_image_base64: bool,
}

#[derive(Debug, Serialize)]
struct OcrDocument {
    #[serde(rename = "type")]
    kind: &'static str,
    document_url: String,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    pages: Vec<OcrPage>,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    markdown: Option<String>,
}

/// PDF text recognition through the Mistral OCR API.
pub struct MistralOcr {
    client: Client,
    config: MistralOcrConfig,
}

impl MistralOcr {
    pub fn new(config: MistralOcrConfig) -> Result<Self, CollectError> {
        config.validate()?;
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

/// Downloaded PDFs are sent inline as a data url; otherwise the service
/// fetches `url` itself.
fn document_source(url: &str, content: Option<&[u8]>) -> String {
    match content {
        Some(bytes) if !bytes.is_empty() => {
            format!("data:application/pdf;base64,{}", STANDARD.encode(bytes))
        }
        _ => url.to_string(),
    }
}

fn payload_to_text(payload: OcrResponse, url: &str) -> Result<String, CollectError> {
    let mut pages = payload
        .pages
        .into_iter()
        .filter_map(|page| {
            let text = page.markdown?.trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some((page.index.unwrap_or(0), text))
            }
        })
        .collect::<Vec<_>>();

    if pages.is_empty() {
        return Err(CollectError::Ocr(format!("ocr response has no readable text: {url}")));
    }

    pages.sort_by_key(|(index, _)| *index);
    Ok(pages
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join("\n"))
}

#[async_trait]
impl OcrProvider for MistralOcr {
    async fn recognize_pdf(&self, url: &str, content: Option<&[u8]>) -> Result<String, CollectError> {
        let request = OcrRequest {
            model: &self.config.model,
            document: OcrDocument {
                kind: "document_url",
                document_url: document_source(url, content),
            },
            include_image_base64: false,
        };

        debug!(url, inline = content.is_some(), "mistral ocr");

        let response = self
            .client
            .post(format!("{}/v1/ocr", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollectError::Ocr(format!(
                "ocr request for {url} failed with {}",
                error_body(response).await
            )));
        }

        let payload: OcrResponse = response.json().await?;
        payload_to_text(payload, url)
    }
}
