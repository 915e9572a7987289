use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{retry_after, KbError, ProviderError};

/// Text-to-vector capability. Every returned vector has `dimension()` entries.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    fn dimension(&self) -> usize;
}

/// Embeds a single text, checking the provider returned exactly one vector.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, ProviderError> {
    let mut vectors = embedder.embed(&[text.to_string()]).await?;
    if vectors.len() != 1 {
        return Err(ProviderError::InvalidResponse(format!(
            "expected 1 embedding, got {}",
            vectors.len()
        )));
    }
    Ok(vectors.remove(0))
}

pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, KbError> {
    match config.backend {
        EmbeddingBackend::Http => Ok(Arc::new(HttpEmbedder::new(config)?)),
        EmbeddingBackend::Local => Ok(Arc::new(LocalEmbedder::new(config)?)),
    }
}

// OpenAI-compatible embeddings endpoint (Voyage, OpenAI, LiteLLM, ...)

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

pub struct HttpEmbedder {
    client: Client,
    timeout: Duration,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, KbError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| KbError::Config(format!("embedding client: {}", e)))?;

        Ok(Self {
            client,
            timeout: config.timeout(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let mut req = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
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
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, wait, body));
        }

        let mut parsed: EmbeddingResponse =
            response.json().await.map_err(|e| ProviderError::from_reqwest(e, self.timeout))?;
        if parsed.data.len() != texts.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// Local ONNX model

pub struct LocalEmbedder {
    model: Arc<TextEmbedding>,
    dimension: usize,
    batch_size: usize,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, KbError> {
        tracing::info!("Initializing embedding model from {}", config.model_dir.display());

        let model_dir = config.model_dir.as_path();
        if !model_dir.exists() {
            return Err(KbError::Config(format!(
                "Model directory not found: {}",
                model_dir.display()
            )));
        }

        let user_model = UserDefinedEmbeddingModel {
            onnx_file: read_model_file(model_dir, "model.onnx")?,
            tokenizer_files: TokenizerFiles {
                tokenizer_file: read_model_file(model_dir, "tokenizer.json")?,
                config_file: read_model_file(model_dir, "config.json")?,
                special_tokens_map_file: read_model_file(model_dir, "special_tokens_map.json")?,
                tokenizer_config_file: read_model_file(model_dir, "tokenizer_config.json")?,
            },
        };

        let model =
            TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
                .map_err(|e| KbError::Config(format!("Failed to initialize embedding model: {}", e)))?;

        tracing::info!("Embedding model initialized ({} dimensions)", config.dimension);
        Ok(Self {
            model: Arc::new(model),
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
        })
    }
}

fn read_model_file(dir: &Path, name: &str) -> Result<Vec<u8>, KbError> {
    std::fs::read(dir.join(name)).map_err(|e| KbError::Config(format!("Failed to read {}: {}", name, e)))
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let batch_size = self.batch_size;

        // ONNX inference is CPU bound
        tokio::task::spawn_blocking(move || model.embed(texts, Some(batch_size)))
            .await
            .map_err(|e| ProviderError::Unavailable(format!("embedding worker: {}", e)))?
            .map_err(|e| ProviderError::Unavailable(e.to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
