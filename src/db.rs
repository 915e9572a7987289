use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::conversation::ConversationStore;
use crate::error::{KbError, Result};
use crate::models::{Direction, KbTopic, Message, Sender};
use crate::rag::topic_store::{check_dimensions, TopicStore};

/// Held for the whole of `insert_topics`. Readers are not blocked.
const TOPIC_WRITE_LOCK: &str = "LOCK TABLE kb_topics IN SHARE ROW EXCLUSIVE MODE";

/// Postgres-backed topic and conversation storage.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct TopicRow {
    id: Uuid,
    title: String,
    content: String,
    source: String,
    content_hash: String,
    embedding: Vec<f32>,
    created_at: DateTime<Utc>,
}

impl From<TopicRow> for KbTopic {
    fn from(row: TopicRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            content: row.content,
            source: row.source,
            content_hash: row.content_hash,
            embedding: row.embedding,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct SenderRow {
    id: Uuid,
    external_id: String,
    display_name: String,
    created_at: DateTime<Utc>,
}

impl From<SenderRow> for Sender {
    fn from(row: SenderRow) -> Self {
        Self {
            id: row.id,
            external_id: row.external_id,
            display_name: row.display_name,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    sender_id: Uuid,
    direction: String,
    body: String,
    timestamp: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = KbError;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            sender_id: row.sender_id,
            direction: row.direction.parse().map_err(KbError::StoreUnavailable)?,
            body: row.body,
            timestamp: row.timestamp,
        })
    }
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kb_topics (
                seq BIGSERIAL,
                id UUID PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                embedding REAL[] NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS senders (
                id UUID PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq BIGSERIAL,
                id UUID PRIMARY KEY,
                sender_id UUID NOT NULL REFERENCES senders(id) ON DELETE CASCADE,
                direction TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')),
                body TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_sender_seq ON messages(sender_id, seq DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Database schema ready");
        Ok(())
    }
}

#[async_trait]
impl TopicStore for PgStore {
    async fn insert_topics(&self, topics: Vec<KbTopic>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        // conflicts with itself, so concurrent batches check the dimension one at a time
        sqlx::query(TOPIC_WRITE_LOCK).execute(&mut *tx).await?;

        let existing: Option<(Option<i32>,)> = sqlx::query_as(
            "SELECT array_length(embedding, 1) FROM kb_topics ORDER BY seq LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let existing = existing.and_then(|(len,)| len).map(|len| len as usize);
        check_dimensions(&topics, existing)?;

        let n = topics.len();
        for topic in topics {
            sqlx::query(
                r#"
                INSERT INTO kb_topics (id, title, content, source, content_hash, embedding, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(topic.id)
            .bind(&topic.title)
            .bind(&topic.content)
            .bind(&topic.source)
            .bind(&topic.content_hash)
            .bind(&topic.embedding)
            .bind(topic.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(n)
    }

    async fn all_topics(&self) -> Result<Vec<KbTopic>> {
        let rows = sqlx::query_as::<_, TopicRow>(
            r#"
            SELECT id, title, content, source, content_hash, embedding, created_at
            FROM kb_topics ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(KbTopic::from).collect())
    }

    async fn embedding_dimension(&self) -> Result<Option<usize>> {
        let row: Option<(Option<i32>,)> = sqlx::query_as(
            "SELECT array_length(embedding, 1) FROM kb_topics ORDER BY seq LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(len,)| len).map(|len| len as usize))
    }

    async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM kb_topics")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kb_topics").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn upsert_sender(&self, external_id: &str, display_name: Option<&str>) -> Result<Sender> {
        let row = sqlx::query_as::<_, SenderRow>(
            r#"
            INSERT INTO senders (id, external_id, display_name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (external_id)
            DO UPDATE SET display_name = COALESCE($5, senders.display_name)
            RETURNING id, external_id, display_name, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_id)
        .bind(display_name.unwrap_or(external_id))
        .bind(Utc::now())
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn find_sender(&self, external_id: &str) -> Result<Option<Sender>> {
        let row = sqlx::query_as::<_, SenderRow>(
            "SELECT id, external_id, display_name, created_at FROM senders WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Sender::from))
    }

    async fn append_message(&self, sender_id: Uuid, direction: Direction, body: &str) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            sender_id,
            direction,
            body: body.to_string(),
            timestamp: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, direction, body, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(message.id)
        .bind(message.sender_id)
        .bind(message.direction.as_str())
        .bind(&message.body)
        .bind(message.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    async fn recent_messages(&self, sender_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, sender_id, direction, body, timestamp FROM (
                SELECT seq, id, sender_id, direction, body, timestamp
                FROM messages WHERE sender_id = $1
                ORDER BY seq DESC LIMIT $2
            ) recent
            ORDER BY seq
            "#,
        )
        .bind(sender_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn delete_sender(&self, sender_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM senders WHERE id = $1")
            .bind(sender_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn counts(&self) -> Result<(u64, u64)> {
        let (senders, messages): (i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM senders), (SELECT COUNT(*) FROM messages)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((senders as u64, messages as u64))
    }

    async fn clear(&self) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await?;
        let messages = sqlx::query("DELETE FROM messages").execute(&mut *tx).await?;
        let senders = sqlx::query("DELETE FROM senders").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok((senders.rows_affected(), messages.rows_affected()))
    }
}
