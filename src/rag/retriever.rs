use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RetrievalConfig;
use crate::error::{KbError, Result};
use crate::models::{KbTopic, ScoredTopic};
use crate::retry::RetryPolicy;
use super::embeddings::{embed_one, Embedder};
use super::topic_store::TopicStore;

/// Ranks stored topics against a query.
///
/// Results are best first; equal scores keep insertion order. An empty store
/// yields an empty result, not an error. An ANN-indexed implementation can
/// replace [`ScanRetriever`] behind this trait without touching callers.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ScoredTopic>>;
}

/// Brute-force cosine scan over every stored topic.
pub struct ScanRetriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn TopicStore>,
    retry: RetryPolicy,
    min_similarity: Option<f32>,
    offload_threshold: usize,
}

impl ScanRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn TopicStore>,
        retry: RetryPolicy,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            retry,
            min_similarity: config.min_similarity,
            offload_threshold: config.scan_offload_threshold,
        }
    }
}

#[async_trait]
impl Retriever for ScanRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ScoredTopic>> {
        let topics = self.store.all_topics().await?;
        if topics.is_empty() || top_k == 0 {
            tracing::debug!("Knowledge base is empty; answering ungrounded");
            return Ok(Vec::new());
        }

        let query_embedding = self
            .retry
            .run("query embedding", || embed_one(self.embedder.as_ref(), query))
            .await
            .map_err(KbError::EmbeddingProvider)?;

        let min_similarity = self.min_similarity;
        let ranked = if topics.len() >= self.offload_threshold {
            tokio::task::spawn_blocking(move || {
                rank_topics(&query_embedding, topics, top_k, min_similarity)
            })
            .await
            .map_err(|e| KbError::Worker(e.to_string()))??
        } else {
            rank_topics(&query_embedding, topics, top_k, min_similarity)?
        };

        tracing::debug!(
            "Retrieved {} topics, scores: {:?}",
            ranked.len(),
            ranked.iter().map(|r| r.score).collect::<Vec<_>>()
        );
        Ok(ranked)
    }
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Scores `topics` (given in insertion order) and keeps the best `top_k`.
pub fn rank_topics(
    query: &[f32],
    topics: Vec<KbTopic>,
    top_k: usize,
    min_similarity: Option<f32>,
) -> Result<Vec<ScoredTopic>> {
    let mut scored = Vec::with_capacity(topics.len());
    for topic in topics {
        if topic.embedding.len() != query.len() {
            return Err(KbError::EmbeddingDimensionMismatch {
                expected: topic.embedding.len(),
                actual: query.len(),
            });
        }
        let score = cosine_similarity(query, &topic.embedding);
        if min_similarity.map_or(true, |min| score >= min) {
            scored.push(ScoredTopic { topic, score });
        }
    }

    // sort_by is stable, so equal scores stay in insertion order
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(top_k);
    Ok(scored)
}
