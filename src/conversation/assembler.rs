use std::sync::Arc;

use tiktoken_rs::CoreBPE;
use uuid::Uuid;

use crate::config::{ConversationConfig, RetrievalConfig};
use crate::error::{KbError, Result};
use crate::generator::ResponseGenerator;
use crate::models::{HistoryTurn, Message, PromptKind, PromptTopic, StructuredPrompt};
use crate::rag::retriever::Retriever;
use super::store::ConversationStore;

/// Builds the grounded generation payload for one inbound message.
pub struct ContextAssembler {
    conversations: Arc<dyn ConversationStore>,
    retriever: Arc<dyn Retriever>,
    rephraser: Option<Arc<dyn ResponseGenerator>>,
    tokenizer: CoreBPE,
    company_name: String,
    history_window: usize,
    history_token_budget: usize,
    top_k: usize,
    high_relevance: f32,
}

impl ContextAssembler {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        retriever: Arc<dyn Retriever>,
        conversation: &ConversationConfig,
        retrieval: &RetrievalConfig,
    ) -> Result<Self> {
        let tokenizer = tiktoken_rs::cl100k_base()
            .map_err(|e| KbError::Config(format!("tokenizer: {}", e)))?;

        Ok(Self {
            conversations,
            retriever,
            rephraser: None,
            tokenizer,
            company_name: conversation.company_name.clone(),
            history_window: conversation.history_window,
            history_token_budget: conversation.history_token_budget,
            top_k: retrieval.top_k,
            high_relevance: retrieval.high_relevance_similarity,
        })
    }

    /// Rewrites each message into a standalone search query with `generator`
    /// before retrieval. The payload keeps the user's original text.
    pub fn with_rephraser(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.rephraser = Some(generator);
        self
    }

    /// History is read for `sender_id` only; callers append the inbound
    /// message afterwards so it is not duplicated in the payload.
    pub async fn assemble(&self, sender_id: Uuid, query: &str) -> Result<StructuredPrompt> {
        let recent = self
            .conversations
            .recent_messages(sender_id, self.history_window)
            .await?;
        let history = self.fit_history(recent);

        let search_query = self.search_query(&history, query).await;
        let scored = self.retriever.retrieve(&search_query, self.top_k).await?;
        let grounded = scored.iter().any(|s| s.score >= self.high_relevance);
        let topics: Vec<PromptTopic> = scored.into_iter().map(PromptTopic::from).collect();

        tracing::debug!(
            "Assembled context for sender {}: {} history turns, {} topics, grounded={}",
            sender_id,
            history.len(),
            topics.len(),
            grounded
        );

        Ok(StructuredPrompt {
            kind: PromptKind::Answer,
            system: self.persona(grounded),
            history,
            topics,
            query: query.to_string(),
            grounded,
        })
    }

    /// Falls back to the raw message when no rephraser is set or it fails.
    async fn search_query(&self, history: &[HistoryTurn], query: &str) -> String {
        let Some(rephraser) = &self.rephraser else {
            return query.to_string();
        };

        let prompt = StructuredPrompt::rephrase(self.rephrase_instructions(), history.to_vec(), query);
        match rephraser.generate(&prompt).await {
            Ok(rephrased) if !rephrased.trim().is_empty() => {
                let rephrased = rephrased.trim().to_string();
                tracing::debug!("Rephrased query '{}' as '{}'", query, rephrased);
                rephrased
            }
            Ok(_) => query.to_string(),
            Err(e) => {
                tracing::warn!("Query rephrasing failed, searching with the raw message: {}", e);
                query.to_string()
            }
        }
    }

    fn rephrase_instructions(&self) -> String {
        format!(
            "Rephrase the following user message as a clear, concise search query for finding \
             relevant {} company documentation.\n\
             - Use English only.\n\
             - Focus on the core question or information need.\n\
             - Use the chat history for context where it helps, but keep to the main query.\n\
             - Return only the rephrased search query, no additional text.",
            self.company_name
        )
    }

    /// Drops the oldest messages until the rest fit the token budget.
    fn fit_history(&self, messages: Vec<Message>) -> Vec<HistoryTurn> {
        let costs: Vec<usize> = messages.iter().map(|m| self.count_tokens(&m.body)).collect();
        let mut total: usize = costs.iter().sum();
        let mut skip = 0;
        while total > self.history_token_budget && skip < messages.len() {
            total -= costs[skip];
            skip += 1;
        }
        if skip > 0 {
            tracing::debug!("Evicted {} oldest messages to fit the history budget", skip);
        }
        messages.into_iter().skip(skip).map(HistoryTurn::from).collect()
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.encode_with_special_tokens(text).len()
    }

    fn persona(&self, grounded: bool) -> String {
        let company = &self.company_name;
        let guidance = if grounded {
            "You have highly relevant company documentation for this question. Base your answer \
             primarily on it and keep the answer focused."
        } else {
            "No highly relevant documentation was found for this question. Give a brief, general \
             answer, say so when you lack specific information, and offer to connect the user \
             with support."
        };
        format!(
            "You are a helpful and knowledgeable representative of {company}. \
             You answer questions from employees and customers in a private chat.\n\
             {guidance}\n\
             Guidelines:\n\
             - Be professional, friendly and concise.\n\
             - Answer in the same language as the user's query.\n\
             - Use plain text without markdown; short paragraphs and simple bullet points \
             (- or •) read best on mobile."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::store::MemoryConversationStore;
    use crate::models::{Direction, KbTopic};
    use crate::rag::retriever::ScanRetriever;
    use crate::rag::topic_store::{MemoryTopicStore, TopicStore};
    use crate::error::ProviderError;
    use crate::testing::{fast_retry, KeywordEmbedder, ScriptedGenerator};
    use std::sync::atomic::Ordering;

    const VOCAB: &[&str] = &["jeen", "api", "vacation", "policy", "workflow"];

    struct Fixture {
        conversations: Arc<MemoryConversationStore>,
        topics: Arc<MemoryTopicStore>,
        embedder: Arc<KeywordEmbedder>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                conversations: Arc::new(MemoryConversationStore::new()),
                topics: Arc::new(MemoryTopicStore::new()),
                embedder: Arc::new(KeywordEmbedder::new(VOCAB)),
            }
        }

        fn assembler(&self, window: usize, budget: usize) -> ContextAssembler {
            let retriever = ScanRetriever::new(
                self.embedder.clone(),
                self.topics.clone(),
                fast_retry(),
                &RetrievalConfig::default(),
            );
            ContextAssembler::new(
                self.conversations.clone(),
                Arc::new(retriever),
                &ConversationConfig {
                    history_window: window,
                    history_token_budget: budget,
                    ..ConversationConfig::default()
                },
                &RetrievalConfig::default(),
            )
            .unwrap()
        }

        async fn add_topic(&self, title: &str, content: &str) {
            let topic = KbTopic::new(title.into(), content.into(), "test".into(), self.embedder.vector(content));
            self.topics.insert_topics(vec![topic]).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_store_produces_ungrounded_payload() {
        let fx = Fixture::new();
        let sender = fx.conversations.upsert_sender("a", None).await.unwrap();
        let prompt = fx.assembler(7, 2000).assemble(sender.id, "hello?").await.unwrap();

        assert!(prompt.topics.is_empty());
        assert!(prompt.history.is_empty());
        assert!(!prompt.grounded);
        assert!(prompt.system.contains("No highly relevant documentation"));
        assert_eq!(prompt.query, "hello?");
    }

    #[tokio::test]
    async fn test_history_window_keeps_newest_oldest_first() {
        let fx = Fixture::new();
        let sender = fx.conversations.upsert_sender("a", None).await.unwrap();
        for i in 0..12 {
            let direction = if i % 2 == 0 { Direction::Inbound } else { Direction::Outbound };
            fx.conversations
                .append_message(sender.id, direction, &format!("message {}", i))
                .await
                .unwrap();
        }

        let prompt = fx.assembler(5, 2000).assemble(sender.id, "next").await.unwrap();
        let bodies: Vec<&str> = prompt.history.iter().map(|h| h.body.as_str()).collect();
        assert_eq!(
            bodies,
            vec!["message 7", "message 8", "message 9", "message 10", "message 11"]
        );
    }

    #[tokio::test]
    async fn test_history_is_scoped_to_sender() {
        let fx = Fixture::new();
        let a = fx.conversations.upsert_sender("a", None).await.unwrap();
        let b = fx.conversations.upsert_sender("b", None).await.unwrap();
        fx.conversations
            .append_message(a.id, Direction::Inbound, "secret from A")
            .await
            .unwrap();
        fx.conversations
            .append_message(b.id, Direction::Inbound, "hello from B")
            .await
            .unwrap();

        let prompt = fx.assembler(7, 2000).assemble(b.id, "anything").await.unwrap();
        assert_eq!(prompt.history.len(), 1);
        assert_eq!(prompt.history[0].body, "hello from B");
        assert!(prompt.to_chat_messages().iter().all(|m| !m.content.contains("secret from A")));
    }

    #[tokio::test]
    async fn test_token_budget_evicts_oldest_first() {
        let fx = Fixture::new();
        let sender = fx.conversations.upsert_sender("a", None).await.unwrap();
        for i in 0..6 {
            let body = format!("turn{} {}", i, "word ".repeat(40));
            fx.conversations
                .append_message(sender.id, Direction::Inbound, &body)
                .await
                .unwrap();
        }

        let assembler = fx.assembler(6, 100);
        let prompt = assembler.assemble(sender.id, "q").await.unwrap();

        assert!(!prompt.history.is_empty());
        assert!(prompt.history.len() < 6);
        let used: usize = prompt.history.iter().map(|h| assembler.count_tokens(&h.body)).sum();
        assert!(used <= 100);
        assert!(prompt.history.last().unwrap().body.starts_with("turn5"));
        let first_kept = 6 - prompt.history.len();
        assert!(prompt.history[0].body.starts_with(&format!("turn{}", first_kept)));
    }

    #[tokio::test]
    async fn test_retrieved_topic_is_included_and_grounds_prompt() {
        let fx = Fixture::new();
        fx.add_topic("Vacation", "Vacation policy is generous").await;
        fx.add_topic("Jeen.ai API", "Jeen.ai provides API X").await;
        let sender = fx.conversations.upsert_sender("a", None).await.unwrap();

        let prompt = fx
            .assembler(7, 2000)
            .assemble(sender.id, "What does Jeen.ai's API do?")
            .await
            .unwrap();

        assert_eq!(prompt.topics[0].content, "Jeen.ai provides API X");
        assert!(prompt.grounded);
        assert!(prompt.system.contains("Jeen.ai"));
        assert!(prompt.system.contains("highly relevant company documentation"));
    }

    #[tokio::test]
    async fn test_rephrased_query_drives_retrieval() {
        let fx = Fixture::new();
        fx.add_topic("Vacation", "Vacation policy is generous").await;
        fx.add_topic("Jeen.ai API", "Jeen.ai provides API X").await;
        let sender = fx.conversations.upsert_sender("a", None).await.unwrap();
        fx.conversations
            .append_message(sender.id, Direction::Inbound, "Tell me about the Jeen.ai API")
            .await
            .unwrap();

        let rephraser = Arc::new(ScriptedGenerator::new(vec![Ok("Jeen.ai API capabilities".into())]));
        let assembler = fx.assembler(7, 2000).with_rephraser(rephraser.clone());
        let prompt = assembler.assemble(sender.id, "ומה זה עושה?").await.unwrap();

        assert_eq!(rephraser.calls.load(Ordering::SeqCst), 1);
        assert_eq!(prompt.topics[0].content, "Jeen.ai provides API X");
        assert!(prompt.grounded);
        assert_eq!(prompt.query, "ומה זה עושה?");
        assert_eq!(prompt.kind, PromptKind::Answer);
    }

    #[tokio::test]
    async fn test_rephrase_failure_searches_raw_message() {
        let fx = Fixture::new();
        fx.add_topic("Vacation", "Vacation policy is generous").await;
        fx.add_topic("Jeen.ai API", "Jeen.ai provides API X").await;
        let sender = fx.conversations.upsert_sender("a", None).await.unwrap();

        let rephraser = Arc::new(ScriptedGenerator::new(vec![Err(ProviderError::Unavailable(
            "down".into(),
        ))]));
        let prompt = fx
            .assembler(7, 2000)
            .with_rephraser(rephraser.clone())
            .assemble(sender.id, "What is the vacation policy?")
            .await
            .unwrap();

        assert_eq!(rephraser.calls.load(Ordering::SeqCst), 1);
        assert_eq!(prompt.topics[0].content, "Vacation policy is generous");
        assert_eq!(prompt.query, "What is the vacation policy?");
    }

    #[tokio::test]
    async fn test_content_passes_through_unmodified() {
        let fx = Fixture::new();
        let hebrew = "מדיניות חופשה: workflow policy";
        fx.add_topic("Policy", hebrew).await;
        let sender = fx.conversations.upsert_sender("a", None).await.unwrap();
        fx.conversations
            .append_message(sender.id, Direction::Inbound, "שלום")
            .await
            .unwrap();

        let prompt = fx.assembler(7, 2000).assemble(sender.id, "policy?").await.unwrap();
        assert_eq!(prompt.topics[0].content, hebrew);
        assert_eq!(prompt.history[0].body, "שלום");
    }
}
