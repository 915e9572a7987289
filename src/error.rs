use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Failures reported by an external provider (embedding or generation).
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("content policy rejection: {0}")]
    ContentPolicyRejection(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Maps a non-success HTTP response to the matching provider error.
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Self::RateLimited { retry_after };
        }
        if status.is_server_error() {
            return Self::Unavailable(format!("{}: {}", status, body));
        }
        let lowered = body.to_lowercase();
        if lowered.contains("content_filter") || lowered.contains("content_policy") {
            return Self::ContentPolicyRejection(body);
        }
        Self::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }

    /// `timeout` is the client timeout, reported when the call ran out of time.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            // connect and body errors mean the service did not answer
            Self::Unavailable(err.to_string())
        }
    }
}

/// Reads a `Retry-After` header expressed in seconds.
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Error)]
pub enum KbError {
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(#[source] ProviderError),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("response generation failed: {0}")]
    Generation(#[source] ProviderError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl KbError {
    /// Errors raised by an external provider; the query pipeline answers these
    /// with the fallback reply instead of failing the request.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::EmbeddingProvider(_) | Self::Generation(_))
    }
}

impl From<sqlx::Error> for KbError {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

pub type Result<T, E = KbError> = std::result::Result<T, E>;
