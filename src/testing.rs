//! Deterministic stand-ins for the external providers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::RetryConfig;
use crate::error::ProviderError;
use crate::generator::ResponseGenerator;
use crate::models::StructuredPrompt;
use crate::rag::embeddings::Embedder;
use crate::retry::RetryPolicy;

/// One dimension per vocabulary word; a text's vector counts the vocabulary
/// words it contains (case-insensitive, split on non-alphanumerics).
pub struct KeywordEmbedder {
    vocabulary: Vec<String>,
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(vocabulary: &[&str]) -> Self {
        Self {
            vocabulary: vocabulary.iter().map(|w| w.to_lowercase()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0; self.vocabulary.len()];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            if let Some(i) = self.vocabulary.iter().position(|w| *w == token) {
                v[i] += 1.0;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.vocabulary.len()
    }
}

/// Always fails with the configured error.
pub struct FailingEmbedder {
    pub error: ProviderError,
    pub dimension: usize,
}

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(self.error.clone())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Claims one dimension but returns vectors of another.
pub struct WrongDimensionEmbedder {
    pub declared: usize,
    pub actual: usize,
}

#[async_trait]
impl Embedder for WrongDimensionEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|_| vec![1.0; self.actual]).collect())
    }

    fn dimension(&self) -> usize {
        self.declared
    }
}

/// Replies with every part of the prompt so tests can look for inclusion.
pub struct EchoGenerator;

#[async_trait]
impl ResponseGenerator for EchoGenerator {
    async fn generate(&self, prompt: &StructuredPrompt) -> Result<String, ProviderError> {
        Ok(prompt
            .to_chat_messages()
            .into_iter()
            .map(|m| format!("[{}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Plays back scripted results, then echoes the query.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    pub calls: AtomicUsize,
    pub delay: Option<std::time::Duration>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn slow(delay: std::time::Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &StructuredPrompt) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(format!("reply to: {}", prompt.query)))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(&RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 2,
    })
}
