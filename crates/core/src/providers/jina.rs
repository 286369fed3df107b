use crate::config::JinaConfig;
use crate::error::CollectError;
use crate::providers::error_body;
use crate::traits::{ensure_parallel, Reranker};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const PROVIDER: &str = "jina";

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    top_n: usize,
    documents: Vec<&'a str>,
    return_documents: bool,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RankedDocument>,
}

#[derive(Debug, Deserialize)]
struct RankedDocument {
    index: usize,
    relevance_score: f64,
}

/// Hosted cross-encoder reranking through the Jina rerank API.
pub struct JinaReranker {
    client: Client,
    config: JinaConfig,
}

impl JinaReranker {
    pub fn new(config: JinaConfig) -> Result<Self, CollectError> {
        config.validate()?;
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn rank_group(&self, query: &str, documents: Vec<&str>) -> Result<RerankResponse, CollectError> {
        let request = RerankRequest {
            model: &self.config.model,
            query,
            top_n: documents.len(),
            documents,
            return_documents: false,
        };

        let response = self
            .client
            .post(&self.config.base_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollectError::provider(PROVIDER, error_body(response).await));
        }

        Ok(response.json().await?)
    }
}

/// Input positions grouped by query, groups in first-seen order.
fn group_by_query(queries: &[String]) -> Vec<(&str, Vec<usize>)> {
    let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
    for (position, query) in queries.iter().enumerate() {
        match groups.iter_mut().find(|(existing, _)| *existing == query.as_str()) {
            Some((_, positions)) => positions.push(position),
            None => groups.push((query.as_str(), vec![position])),
        }
    }
    groups
}

fn scatter_scores(
    response: RerankResponse,
    positions: &[usize],
    scores: &mut [Option<f64>],
) -> Result<(), CollectError> {
    for ranked in response.results {
        let position = positions.get(ranked.index).ok_or_else(|| {
            CollectError::provider(PROVIDER, format!("ranked unknown document index {}", ranked.index))
        })?;
        scores[*position] = Some(ranked.relevance_score);
    }
    Ok(())
}

#[async_trait]
impl Reranker for JinaReranker {
    async fn score(&self, queries: &[String], documents: &[String]) -> Result<Vec<f64>, CollectError> {
        ensure_parallel(queries, documents)?;

        let mut scores = vec![None; documents.len()];
        for (query, positions) in group_by_query(queries) {
            let group = positions
                .iter()
                .map(|position| documents[*position].as_str())
                .collect::<Vec<_>>();
            debug!(query, documents = group.len(), "jina rerank");

            let response = self.rank_group(query, group).await?;
            scatter_scores(response, &positions, &mut scores)?;
        }

        scores
            .into_iter()
            .enumerate()
            .map(|(position, score)| {
                score.ok_or_else(|| {
                    CollectError::provider(PROVIDER, format!("no score for document {position}"))
                })
            })
            .collect()
    }
}
