use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::GenerationConfig;
use crate::error::{retry_after, KbError, ProviderError};
use crate::models::{ChatRequest, ChatResponse, StructuredPrompt};

/// Produces the reply text for an assembled prompt.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, prompt: &StructuredPrompt) -> Result<String, ProviderError>;

    fn name(&self) -> &str;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint (LiteLLM,
/// OpenAI, Gemini's compatibility layer).
pub struct ChatCompletionGenerator {
    client: Client,
    timeout: Duration,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl ChatCompletionGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, KbError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| KbError::Config(format!("generation client: {}", e)))?;

        Ok(Self {
            client,
            timeout: config.timeout(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn request(&self, prompt: &StructuredPrompt) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: prompt.to_chat_messages(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub async fn health_check(&self) -> anyhow::Result<bool> {
        let url = format!("{}/health/liveliness", self.base_url);

        let response = self.client.get(&url).send().await?;

        Ok(response.status().is_success())
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionGenerator {
    async fn generate(&self, prompt: &StructuredPrompt) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self.client.post(&url).json(&self.request(prompt));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let wait = retry_after(response.headers());
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, wait, error_text));
        }

        let chat_response: ChatResponse =
            response.json().await.map_err(|e| ProviderError::from_reqwest(e, self.timeout))?;
        reply_text(chat_response)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Extracts the first choice's text.
pub fn reply_text(response: ChatResponse) -> Result<String, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("no choices in completion".into()))?;

    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(ProviderError::ContentPolicyRejection(
            "completion stopped by content filter".into(),
        ));
    }
    if choice.message.content.trim().is_empty() {
        return Err(ProviderError::InvalidResponse("empty completion".into()));
    }
    Ok(choice.message.content)
}
