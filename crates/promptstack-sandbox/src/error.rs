//! Error types for sandbox operations.

use thiserror::Error;

/// Errors raised by a [`ResourceProvider`](crate::ResourceProvider).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The compute backend could not be reached.
    #[error("sandbox provider unavailable: {0}")]
    Unavailable(String),

    #[error("failed to pull image '{image}': {message}")]
    ImagePullFailed { image: String, message: String },

    #[error("failed to create sandbox: {0}")]
    CreateFailed(String),

    #[error("failed to start sandbox: {0}")]
    StartFailed(String),

    /// The handle no longer refers to a sandbox.
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox is not running")]
    NotRunning,

    #[error("command execution failed: {0}")]
    ExecFailed(String),

    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("failed to read file '{path}': {message}")]
    ReadFailed { path: String, message: String },

    #[error("failed to write file '{path}': {message}")]
    WriteFailed { path: String, message: String },

    #[error("volume error: {0}")]
    Volume(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn image_pull_failed(image: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ImagePullFailed {
            image: image.into(),
            message: message.into(),
        }
    }

    pub fn read_failed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ReadFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn write_failed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WriteFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Failures worth retrying with backoff: the backend is down or overloaded,
    /// not the request itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::CreateFailed(_) | Self::StartFailed(_) | Self::Timeout(_)
        )
    }

    /// The sandbox behind the handle is gone or stopped.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NotRunning)
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SandboxError::unavailable("daemon down").is_transient());
        assert!(SandboxError::Timeout(std::time::Duration::from_secs(1)).is_transient());
        assert!(!SandboxError::NotFound("sbx_1".into()).is_transient());
        assert!(!SandboxError::FileNotFound("/app/x".into()).is_transient());
    }

    #[test]
    fn gone_classification() {
        assert!(SandboxError::NotRunning.is_gone());
        assert!(SandboxError::NotFound("sbx_1".into()).is_gone());
        assert!(!SandboxError::ExecFailed("boom".into()).is_gone());
    }
}
