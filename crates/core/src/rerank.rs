use crate::error::CollectError;
use crate::models::SearchResult;
use crate::traits::{ensure_parallel, Reranker};
use async_trait::async_trait;

pub const DEFAULT_VECTOR_DIMENSIONS: usize = 256;

/// Offline reranker scoring pairs by the cosine similarity of hashed
/// character-trigram vectors.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramReranker {
    pub dimensions: usize,
}

impl Default for CharacterNgramReranker {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_VECTOR_DIMENSIONS,
        }
    }
}

impl CharacterNgramReranker {
    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }

    pub fn similarity(&self, query: &str, document: &str) -> f64 {
        let query = self.vectorize(query);
        let document = self.vectorize(document);
        query
            .iter()
            .zip(document.iter())
            .map(|(left, right)| f64::from(left * right))
            .sum()
    }
}

#[async_trait]
impl Reranker for CharacterNgramReranker {
    async fn score(&self, queries: &[String], documents: &[String]) -> Result<Vec<f64>, CollectError> {
        ensure_parallel(queries, documents)?;
        Ok(queries
            .iter()
            .zip(documents.iter())
            .map(|(query, document)| self.similarity(query, document))
            .collect())
    }
}

/// Scores each result against its own query and keeps the best `top_n` per
/// query, highest score first. Query groups keep their first-seen order.
pub async fn rerank_results(
    reranker: &dyn Reranker,
    results: Vec<SearchResult>,
    top_n: usize,
) -> Result<Vec<SearchResult>, CollectError> {
    if results.is_empty() {
        return Ok(results);
    }

    let queries = results.iter().map(|result| result.query.clone()).collect::<Vec<_>>();
    let documents = results
        .iter()
        .map(SearchResult::rerank_document)
        .collect::<Vec<_>>();
    let scores = reranker.score(&queries, &documents).await?;

    if scores.len() != results.len() {
        return Err(CollectError::provider(
            "reranker",
            format!("returned {} scores for {} documents", scores.len(), results.len()),
        ));
    }

    let mut groups: Vec<(String, Vec<SearchResult>)> = Vec::new();
    for (mut result, score) in results.into_iter().zip(scores) {
        result.score = Some(score);
        match groups.iter_mut().find(|(query, _)| *query == result.query) {
            Some((_, group)) => group.push(result),
            None => groups.push((result.query.clone(), vec![result])),
        }
    }

    let mut kept = Vec::new();
    for (_, mut group) in groups {
        group.sort_by(|left, right| {
            right
                .score
                .unwrap_or_default()
                .total_cmp(&left.score.unwrap_or_default())
        });
        kept.extend(group.into_iter().take(top_n));
    }

    Ok(kept)
}
