use crate::conversation::ConversationStore;
use crate::error::Result;
use crate::models::StoreCounts;
use crate::rag::TopicStore;

/// Empties the knowledge base and every conversation. Returns what was
/// removed; running it on empty stores is a no-op.
pub async fn clear_all(
    topics: &dyn TopicStore,
    conversations: &dyn ConversationStore,
) -> Result<StoreCounts> {
    let removed_topics = topics.clear().await.map_err(|e| {
        tracing::error!("Failed to clear topics: {}", e);
        e
    })?;
    let (senders, messages) = conversations.clear().await.map_err(|e| {
        tracing::error!("Failed to clear conversations: {}", e);
        e
    })?;

    let counts = StoreCounts {
        topics: removed_topics,
        senders,
        messages,
    };
    tracing::info!(
        "Cleared {} topics, {} messages and {} senders",
        counts.topics,
        counts.messages,
        counts.senders
    );
    Ok(counts)
}

/// Current row counts.
pub async fn status(
    topics: &dyn TopicStore,
    conversations: &dyn ConversationStore,
) -> Result<StoreCounts> {
    let (senders, messages) = conversations.counts().await?;
    Ok(StoreCounts {
        topics: topics.count().await?,
        senders,
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::MemoryConversationStore;
    use crate::models::{Direction, KbTopic};
    use crate::rag::MemoryTopicStore;

    async fn seeded() -> (MemoryTopicStore, MemoryConversationStore) {
        let topics = MemoryTopicStore::new();
        topics
            .insert_topics(vec![
                KbTopic::new("a".into(), "alpha".into(), "test".into(), vec![1.0, 0.0]),
                KbTopic::new("b".into(), "beta".into(), "test".into(), vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        let conversations = MemoryConversationStore::new();
        let sender = conversations.upsert_sender("a", None).await.unwrap();
        conversations
            .append_message(sender.id, Direction::Inbound, "hi")
            .await
            .unwrap();
        conversations
            .append_message(sender.id, Direction::Outbound, "hello")
            .await
            .unwrap();
        (topics, conversations)
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let (topics, conversations) = seeded().await;
        let counts = status(&topics, &conversations).await.unwrap();
        assert_eq!(
            counts,
            StoreCounts {
                topics: 2,
                senders: 1,
                messages: 2
            }
        );
    }

    #[tokio::test]
    async fn test_clear_all_empties_everything_and_is_idempotent() {
        let (topics, conversations) = seeded().await;

        let removed = clear_all(&topics, &conversations).await.unwrap();
        assert_eq!(removed.topics, 2);
        assert_eq!(removed.messages, 2);
        assert_eq!(removed.senders, 1);
        assert_eq!(status(&topics, &conversations).await.unwrap(), StoreCounts::default());

        let again = clear_all(&topics, &conversations).await.unwrap();
        assert_eq!(again, StoreCounts::default());
    }
}
