use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// Knowledge base

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbTopic {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub source: String,
    pub content_hash: String,
    #[serde(skip_serializing)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl KbTopic {
    pub fn new(title: String, content: String, source: String, embedding: Vec<f32>) -> Self {
        let content_hash = content_hash(&title, &content);
        Self {
            id: Uuid::new_v4(),
            title,
            content,
            source,
            content_hash,
            embedding,
            created_at: Utc::now(),
        }
    }
}

/// Hex sha256 over `title_content`. Provenance only; ingestion never deduplicates.
pub fn content_hash(title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"_");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredTopic {
    pub topic: KbTopic,
    pub score: f32,
}

fn default_source() -> String {
    "manual_upload".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentUpload {
    pub title: String,
    pub content: String,
    #[serde(default = "default_source")]
    pub source: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub documents: usize,
    pub topics_created: usize,
}

// Conversations

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sender {
    pub id: Uuid,
    pub external_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("invalid message direction: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub direction: Direction,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundQuery {
    pub sender: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub message: String,
}

// Generation payload

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryTurn {
    pub direction: Direction,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl From<Message> for HistoryTurn {
    fn from(msg: Message) -> Self {
        Self {
            direction: msg.direction,
            body: msg.body,
            timestamp: msg.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromptTopic {
    pub title: String,
    pub content: String,
    pub source: String,
    pub score: f32,
}

impl From<ScoredTopic> for PromptTopic {
    fn from(scored: ScoredTopic) -> Self {
        Self {
            title: scored.topic.title,
            content: scored.topic.content,
            source: scored.topic.source,
            score: scored.score,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Grounded reply to the user.
    #[default]
    Answer,
    /// Standalone search query built from the message and its history.
    Rephrase,
}

/// Everything the response generator needs for one reply.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredPrompt {
    pub kind: PromptKind,
    pub system: String,
    /// Oldest first.
    pub history: Vec<HistoryTurn>,
    /// Best match first.
    pub topics: Vec<PromptTopic>,
    pub query: String,
    pub grounded: bool,
}

impl StructuredPrompt {
    pub fn rephrase(system: String, history: Vec<HistoryTurn>, query: &str) -> Self {
        Self {
            kind: PromptKind::Rephrase,
            system,
            history,
            topics: Vec::new(),
            query: query.to_string(),
            grounded: false,
        }
    }

    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        if self.kind == PromptKind::Rephrase {
            return self.rephrase_messages();
        }

        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::new("system", &self.system));

        for turn in &self.history {
            let role = match turn.direction {
                Direction::Inbound => "user",
                Direction::Outbound => "assistant",
            };
            messages.push(ChatMessage::new(role, &turn.body));
        }

        let documentation = if self.topics.is_empty() {
            "No relevant documentation found for this query.".to_string()
        } else {
            self.topics
                .iter()
                .map(|t| format!("{}\n{}", t.title, t.content))
                .collect::<Vec<_>>()
                .join("\n---\n")
        };
        let heading = if self.grounded {
            "# Highly relevant company documentation:"
        } else {
            "# Available documentation:"
        };
        messages.push(ChatMessage::new(
            "user",
            &format!("{}\n{}\n\nUser query: {}", heading, documentation, self.query),
        ));

        messages
    }

    /// History goes inline under the message, one `direction: body` line per turn.
    fn rephrase_messages(&self) -> Vec<ChatMessage> {
        let history = self
            .history
            .iter()
            .map(|turn| format!("{}: {}", turn.direction, turn.body))
            .collect::<Vec<_>>()
            .join("\n");
        vec![
            ChatMessage::new("system", &self.system),
            ChatMessage::new(
                "user",
                &format!("{}\n\n## Recent chat history:\n{}", self.query, history),
            ),
        ]
    }
}

// OpenAI-compatible chat completion wire types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

// Administration

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub topics: u64,
    pub senders: u64,
    pub messages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(grounded: bool, topics: Vec<PromptTopic>) -> StructuredPrompt {
        StructuredPrompt {
            kind: PromptKind::Answer,
            system: "persona".into(),
            history: vec![
                HistoryTurn {
                    direction: Direction::Inbound,
                    body: "hi".into(),
                    timestamp: Utc::now(),
                },
                HistoryTurn {
                    direction: Direction::Outbound,
                    body: "hello!".into(),
                    timestamp: Utc::now(),
                },
            ],
            topics,
            query: "what is the API?".into(),
            grounded,
        }
    }

    #[test]
    fn test_chat_messages_roles_and_order() {
        let messages = prompt(false, Vec::new()).to_chat_messages();
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[0].content, "persona");
        let last = &messages[3].content;
        assert!(last.contains("No relevant documentation"));
        assert!(last.ends_with("User query: what is the API?"));
    }

    #[test]
    fn test_chat_messages_include_topics() {
        let topics = vec![PromptTopic {
            title: "API".into(),
            content: "The API does X".into(),
            source: "docs".into(),
            score: 0.9,
        }];
        let messages = prompt(true, topics).to_chat_messages();
        let last = &messages.last().unwrap().content;
        assert!(last.starts_with("# Highly relevant company documentation:"));
        assert!(last.contains("The API does X"));
    }

    #[test]
    fn test_rephrase_prompt_inlines_history() {
        let base = prompt(false, Vec::new());
        let rephrase = StructuredPrompt::rephrase("rewrite".into(), base.history, "and the price?");
        let messages = rephrase.to_chat_messages();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "rewrite");
        assert_eq!(
            messages[1].content,
            "and the price?\n\n## Recent chat history:\ninbound: hi\noutbound: hello!"
        );
        assert!(!messages[1].content.contains("documentation"));
    }

    #[test]
    fn test_direction_round_trip_from_str() {
        assert_eq!("inbound".parse::<Direction>(), Ok(Direction::Inbound));
        assert_eq!(Direction::Outbound.to_string(), "outbound");
        assert!("group".parse::<Direction>().is_err());
    }

    #[test]
    fn test_upload_source_defaults() {
        let doc: DocumentUpload =
            serde_json::from_str(r#"{"title":"t","content":"c"}"#).unwrap();
        assert_eq!(doc.source, "manual_upload");
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("a", "b"), content_hash("a", "b"));
        assert_ne!(content_hash("a", "b"), content_hash("a", "c"));
        assert_eq!(content_hash("a", "b").len(), 64);
    }
}
