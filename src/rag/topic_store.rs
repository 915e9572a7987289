use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{KbError, Result};
use crate::models::KbTopic;

/// Durable collection of knowledge topics.
///
/// `insert_topics` is all-or-nothing: a concurrent `all_topics` sees either
/// none of the batch or all of it, each topic with its embedding attached.
#[async_trait]
pub trait TopicStore: Send + Sync {
    /// Appends `topics` in order. Returns the number inserted.
    async fn insert_topics(&self, topics: Vec<KbTopic>) -> Result<usize>;

    /// Every topic, oldest insertion first.
    async fn all_topics(&self) -> Result<Vec<KbTopic>>;

    /// Embedding length of the stored topics, `None` when empty.
    async fn embedding_dimension(&self) -> Result<Option<usize>>;

    async fn count(&self) -> Result<u64>;

    /// Deletes every topic. Returns how many were removed.
    async fn clear(&self) -> Result<u64>;
}

/// Rejects a batch whose vectors disagree with each other or with `expected`.
pub fn check_dimensions(topics: &[KbTopic], expected: Option<usize>) -> Result<()> {
    let expected = match expected.or_else(|| topics.first().map(|t| t.embedding.len())) {
        Some(d) => d,
        None => return Ok(()),
    };
    match topics.iter().find(|t| t.embedding.len() != expected) {
        Some(bad) => Err(KbError::EmbeddingDimensionMismatch {
            expected,
            actual: bad.embedding.len(),
        }),
        None => Ok(()),
    }
}

#[derive(Default)]
pub struct MemoryTopicStore {
    topics: RwLock<Vec<KbTopic>>,
}

impl MemoryTopicStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopicStore for MemoryTopicStore {
    async fn insert_topics(&self, topics: Vec<KbTopic>) -> Result<usize> {
        let mut stored = self.topics.write().await;
        let existing = stored.first().map(|t| t.embedding.len());
        check_dimensions(&topics, existing)?;
        let n = topics.len();
        stored.extend(topics);
        Ok(n)
    }

    async fn all_topics(&self) -> Result<Vec<KbTopic>> {
        Ok(self.topics.read().await.clone())
    }

    async fn embedding_dimension(&self) -> Result<Option<usize>> {
        Ok(self.topics.read().await.first().map(|t| t.embedding.len()))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.topics.read().await.len() as u64)
    }

    async fn clear(&self) -> Result<u64> {
        let mut stored = self.topics.write().await;
        let n = stored.len() as u64;
        stored.clear();
        Ok(n)
    }
}
