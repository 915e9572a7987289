use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::{ConversationConfig, GenerationConfig};
use crate::conversation::{ContextAssembler, ConversationStore};
use crate::error::{KbError, ProviderError, Result};
use crate::generator::ResponseGenerator;
use crate::models::{Direction, InboundQuery, StructuredPrompt};
use crate::retry::RetryPolicy;

/// Handles one inbound private message end to end: sender upsert, context
/// assembly, generation and persistence of both sides of the exchange.
///
/// Messages from one sender are processed one at a time in arrival order;
/// different senders proceed concurrently.
pub struct QueryPipeline {
    conversations: Arc<dyn ConversationStore>,
    assembler: ContextAssembler,
    generator: Arc<dyn ResponseGenerator>,
    retry: RetryPolicy,
    generation_timeout: Duration,
    fallback_reply: String,
    sender_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl QueryPipeline {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        assembler: ContextAssembler,
        generator: Arc<dyn ResponseGenerator>,
        retry: RetryPolicy,
        conversation: &ConversationConfig,
        generation: &GenerationConfig,
    ) -> Self {
        Self {
            conversations,
            assembler,
            generator,
            retry,
            generation_timeout: generation.timeout(),
            fallback_reply: conversation.fallback_reply.clone(),
            sender_locks: DashMap::new(),
        }
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub async fn handle(&self, query: InboundQuery) -> Result<String> {
        let key = query.sender.clone();
        let lock = self.sender_locks.entry(key.clone()).or_default().clone();

        let result = {
            let _guard = lock.lock().await;
            self.handle_locked(query).await
        };

        // only the map and `lock` remain when no later message is queued
        self.sender_locks
            .remove_if(&key, |_, entry| Arc::strong_count(entry) == 2);
        result
    }

    async fn handle_locked(&self, query: InboundQuery) -> Result<String> {
        let sender = self
            .conversations
            .upsert_sender(&query.sender, query.display_name.as_deref())
            .await
            .map_err(|e| {
                tracing::error!("Failed to upsert sender {}: {}", query.sender, e);
                e
            })?;

        tracing::info!("Processing message from {}", sender.external_id);

        let prompt = match self.assembler.assemble(sender.id, &query.message).await {
            Ok(prompt) => Some(prompt),
            Err(e) if e.is_provider_failure() => {
                tracing::warn!("Context assembly failed for {}: {}", sender.external_id, e);
                None
            }
            Err(e) => {
                tracing::error!("Context assembly failed for {}: {}", sender.external_id, e);
                return Err(e);
            }
        };

        self.conversations
            .append_message(sender.id, Direction::Inbound, &query.message)
            .await?;

        let reply = match prompt {
            Some(prompt) => match self.generate(&prompt).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(
                        "Generation failed for {}, sending fallback reply: {}",
                        sender.external_id,
                        KbError::Generation(e)
                    );
                    self.fallback_reply.clone()
                }
            },
            None => self.fallback_reply.clone(),
        };

        self.conversations
            .append_message(sender.id, Direction::Outbound, &reply)
            .await?;

        tracing::info!("Replied to {} ({} chars)", sender.external_id, reply.chars().count());
        Ok(reply)
    }

    async fn generate(&self, prompt: &StructuredPrompt) -> Result<String, ProviderError> {
        let timeout = self.generation_timeout;
        self.retry
            .run("response generation", || async move {
                match tokio::time::timeout(timeout, self.generator.generate(prompt)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(timeout)),
                }
            })
            .await
    }
}
