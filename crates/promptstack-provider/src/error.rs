//! Provider error types.

use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no api key configured for {0}")]
    MissingApiKey(String),

    #[error("api key rejected by {0}")]
    InvalidApiKey(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        retry_after: Option<std::time::Duration>,
    },

    #[error("stream ended before completion")]
    StreamInterrupted,

    #[error("cancelled")]
    Cancelled,

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream returned {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("{message}")]
    Internal { message: String },
}

impl ProviderError {
    pub fn missing_api_key(provider: impl Into<String>) -> Self {
        Self::MissingApiKey(provider.into())
    }

    pub fn invalid_api_key(provider: impl Into<String>) -> Self {
        Self::InvalidApiKey(provider.into())
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Network blips, throttling and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RequestFailed(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::StreamInterrupted => true,
            ProviderError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::api_error(503, "overloaded").is_retryable());
        assert!(!ProviderError::api_error(400, "bad request").is_retryable());
        assert!(!ProviderError::missing_api_key("openai").is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }
}
