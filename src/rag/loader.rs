use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};

use crate::config::{ChunkingConfig, EmbeddingConfig};
use crate::error::{KbError, Result};
use crate::indexer::chunker::chunk_text;
use crate::models::{DocumentUpload, IngestReport, KbTopic};
use crate::retry::RetryPolicy;
use super::embeddings::Embedder;
use super::topic_store::TopicStore;

/// Concurrent embedding requests per upload.
const EMBED_CONCURRENCY: usize = 2;

struct PendingTopic {
    title: String,
    content: String,
    source: String,
}

impl PendingTopic {
    fn embedding_input(&self) -> String {
        format!("# {}\n{}", self.title, self.content)
    }
}

/// Splits documents into topics, embeds them and stores them.
pub struct DocumentLoader {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn TopicStore>,
    retry: RetryPolicy,
    max_chunk_size: usize,
    batch_size: usize,
}

impl DocumentLoader {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn TopicStore>,
        retry: RetryPolicy,
        chunking: &ChunkingConfig,
        embedding: &EmbeddingConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            retry,
            max_chunk_size: chunking.max_chunk_size,
            batch_size: embedding.batch_size.max(1),
        }
    }

    /// Ingests `documents` as one unit: if any embedding fails or has the wrong
    /// length, nothing is written.
    pub async fn load(&self, documents: &[DocumentUpload]) -> Result<IngestReport> {
        if documents.is_empty() {
            return Ok(IngestReport::default());
        }
        tracing::info!("Processing {} company documents for embedding", documents.len());

        let pending = self.split_documents(documents);
        if pending.is_empty() {
            return Ok(IngestReport {
                documents: documents.len(),
                topics_created: 0,
            });
        }

        let embeddings = self.embed_all(&pending).await?;
        self.check_store_dimension().await?;

        let topics: Vec<KbTopic> = pending
            .into_iter()
            .zip(embeddings)
            .map(|(p, embedding)| KbTopic::new(p.title, p.content, p.source, embedding))
            .collect();

        let created = self.store.insert_topics(topics).await.map_err(|e| {
            tracing::error!("Failed to store topics: {}", e);
            e
        })?;

        tracing::info!(
            "Loaded {} topics from {} documents into the knowledge base",
            created,
            documents.len()
        );
        Ok(IngestReport {
            documents: documents.len(),
            topics_created: created,
        })
    }

    fn split_documents(&self, documents: &[DocumentUpload]) -> Vec<PendingTopic> {
        let mut pending = Vec::new();
        for doc in documents {
            let chunks = chunk_text(&doc.content, self.max_chunk_size);
            if chunks.is_empty() {
                tracing::warn!("Document '{}' has no content; skipped", doc.title);
                continue;
            }
            let total = chunks.len();
            for chunk in chunks {
                let title = if total == 1 {
                    doc.title.clone()
                } else {
                    format!("{} ({}/{})", doc.title, chunk.chunk_index + 1, total)
                };
                pending.push(PendingTopic {
                    title,
                    content: chunk.text,
                    source: doc.source.clone(),
                });
            }
        }
        pending
    }

    async fn embed_all(&self, pending: &[PendingTopic]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<String> = pending.iter().map(PendingTopic::embedding_input).collect();
        let expected = self.embedder.dimension();

        let batch_futures: Vec<_> = inputs
            .chunks(self.batch_size)
            .map(|batch| async move {
                let vectors = self
                    .retry
                    .run("embedding batch", || self.embedder.embed(batch))
                    .await
                    .map_err(|e| {
                        tracing::error!("Embedding provider failed, rejecting upload: {}", e);
                        KbError::EmbeddingProvider(e)
                    })?;
                validate_batch(batch.len(), &vectors, expected)?;
                Ok::<_, KbError>(vectors)
            })
            .collect();
        let batches: Vec<Vec<Vec<f32>>> = futures::stream::iter(batch_futures)
            .buffered(EMBED_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(batches.into_iter().flatten().collect())
    }

    async fn check_store_dimension(&self) -> Result<()> {
        let expected = self.embedder.dimension();
        match self.store.embedding_dimension().await? {
            Some(stored) if stored != expected => {
                tracing::error!(
                    "Store holds {}-dimensional topics but the embedder produces {}",
                    stored,
                    expected
                );
                Err(KbError::EmbeddingDimensionMismatch {
                    expected: stored,
                    actual: expected,
                })
            }
            _ => Ok(()),
        }
    }
}

fn validate_batch(requested: usize, vectors: &[Vec<f32>], expected: usize) -> Result<()> {
    if vectors.len() != requested {
        return Err(KbError::EmbeddingProvider(
            crate::error::ProviderError::InvalidResponse(format!(
                "requested {} embeddings, received {}",
                requested,
                vectors.len()
            )),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        tracing::error!("Embedding of length {} where {} was expected", bad.len(), expected);
        return Err(KbError::EmbeddingDimensionMismatch {
            expected,
            actual: bad.len(),
        });
    }
    Ok(())
}
