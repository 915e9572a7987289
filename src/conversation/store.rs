use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{KbError, Result};
use crate::models::{Direction, Message, Sender};

/// Private-chat senders and their append-only message history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns the sender for `external_id`, creating it on first contact.
    /// A provided `display_name` replaces the stored one.
    async fn upsert_sender(&self, external_id: &str, display_name: Option<&str>) -> Result<Sender>;

    async fn find_sender(&self, external_id: &str) -> Result<Option<Sender>>;

    async fn append_message(&self, sender_id: Uuid, direction: Direction, body: &str) -> Result<Message>;

    /// The `limit` newest messages of one sender, oldest first.
    async fn recent_messages(&self, sender_id: Uuid, limit: usize) -> Result<Vec<Message>>;

    /// Deletes a sender together with its messages.
    async fn delete_sender(&self, sender_id: Uuid) -> Result<bool>;

    /// Returns `(senders, messages)`.
    async fn counts(&self) -> Result<(u64, u64)>;

    /// Deletes all messages and senders. Returns the counts removed.
    async fn clear(&self) -> Result<(u64, u64)>;
}

#[derive(Default)]
struct Tables {
    senders: HashMap<Uuid, Sender>,
    by_external_id: HashMap<String, Uuid>,
    messages: HashMap<Uuid, Vec<Message>>,
}

#[derive(Default)]
pub struct MemoryConversationStore {
    tables: RwLock<Tables>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn upsert_sender(&self, external_id: &str, display_name: Option<&str>) -> Result<Sender> {
        let mut tables = self.tables.write().await;
        if let Some(id) = tables.by_external_id.get(external_id).copied() {
            let sender = tables
                .senders
                .get_mut(&id)
                .ok_or_else(|| KbError::StoreUnavailable(format!("dangling sender {}", id)))?;
            if let Some(name) = display_name {
                sender.display_name = name.to_string();
            }
            return Ok(sender.clone());
        }

        let sender = Sender {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            display_name: display_name.unwrap_or(external_id).to_string(),
            created_at: Utc::now(),
        };
        tables.by_external_id.insert(sender.external_id.clone(), sender.id);
        tables.senders.insert(sender.id, sender.clone());
        Ok(sender)
    }

    async fn find_sender(&self, external_id: &str) -> Result<Option<Sender>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_external_id
            .get(external_id)
            .and_then(|id| tables.senders.get(id))
            .cloned())
    }

    async fn append_message(&self, sender_id: Uuid, direction: Direction, body: &str) -> Result<Message> {
        let mut tables = self.tables.write().await;
        if !tables.senders.contains_key(&sender_id) {
            return Err(KbError::StoreUnavailable(format!("unknown sender {}", sender_id)));
        }
        let message = Message {
            id: Uuid::new_v4(),
            sender_id,
            direction,
            body: body.to_string(),
            timestamp: Utc::now(),
        };
        tables.messages.entry(sender_id).or_default().push(message.clone());
        Ok(message)
    }

    async fn recent_messages(&self, sender_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        let history = tables.messages.get(&sender_id).map(Vec::as_slice).unwrap_or_default();
        let start = history.len().saturating_sub(limit);
        Ok(history[start..].to_vec())
    }

    async fn delete_sender(&self, sender_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.senders.remove(&sender_id) {
            Some(sender) => {
                tables.by_external_id.remove(&sender.external_id);
                tables.messages.remove(&sender_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn counts(&self) -> Result<(u64, u64)> {
        let tables = self.tables.read().await;
        let messages: usize = tables.messages.values().map(Vec::len).sum();
        Ok((tables.senders.len() as u64, messages as u64))
    }

    async fn clear(&self) -> Result<(u64, u64)> {
        let mut tables = self.tables.write().await;
        let senders = tables.senders.len() as u64;
        let messages = tables.messages.values().map(Vec::len).sum::<usize>() as u64;
        *tables = Tables::default();
        Ok((senders, messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_sender_is_stable_per_external_id() {
        let store = MemoryConversationStore::new();
        let first = store.upsert_sender("972500000001", None).await.unwrap();
        assert_eq!(first.display_name, "972500000001");

        let again = store.upsert_sender("972500000001", Some("Dana")).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.display_name, "Dana");

        let unchanged = store.upsert_sender("972500000001", None).await.unwrap();
        assert_eq!(unchanged.display_name, "Dana");

        let other = store.upsert_sender("972500000002", None).await.unwrap();
        assert_ne!(other.id, first.id);
        assert_eq!(store.counts().await.unwrap(), (2, 0));
    }

    #[tokio::test]
    async fn test_recent_messages_window_oldest_first() {
        let store = MemoryConversationStore::new();
        let sender = store.upsert_sender("a", None).await.unwrap();
        for i in 0..10 {
            store
                .append_message(sender.id, Direction::Inbound, &format!("m{}", i))
                .await
                .unwrap();
        }
        let recent = store.recent_messages(sender.id, 3).await.unwrap();
        let bodies: Vec<&str> = recent.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m7", "m8", "m9"]);

        let all = store.recent_messages(sender.id, 50).await.unwrap();
        assert_eq!(all.len(), 10);
        assert!(store.recent_messages(Uuid::new_v4(), 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_requires_known_sender() {
        let store = MemoryConversationStore::new();
        let result = store.append_message(Uuid::new_v4(), Direction::Inbound, "hi").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_sender_cascades() {
        let store = MemoryConversationStore::new();
        let a = store.upsert_sender("a", None).await.unwrap();
        let b = store.upsert_sender("b", None).await.unwrap();
        store.append_message(a.id, Direction::Inbound, "from a").await.unwrap();
        store.append_message(b.id, Direction::Inbound, "from b").await.unwrap();

        assert!(store.delete_sender(a.id).await.unwrap());
        assert!(!store.delete_sender(a.id).await.unwrap());
        assert!(store.find_sender("a").await.unwrap().is_none());
        assert!(store.recent_messages(a.id, 10).await.unwrap().is_empty());
        assert_eq!(store.counts().await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let store = MemoryConversationStore::new();
        let a = store.upsert_sender("a", None).await.unwrap();
        store.append_message(a.id, Direction::Inbound, "x").await.unwrap();
        store.append_message(a.id, Direction::Outbound, "y").await.unwrap();

        assert_eq!(store.clear().await.unwrap(), (1, 2));
        assert_eq!(store.clear().await.unwrap(), (0, 0));
        assert_eq!(store.counts().await.unwrap(), (0, 0));
    }
}
