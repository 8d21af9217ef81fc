//! Error types for the core crate.

use promptstack_provider::ProviderError;
use promptstack_sandbox::SandboxError;
use promptstack_storage::StorageError;
use promptstack_tools::ToolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No prepared sandbox is available for the template yet.
    #[error("no prepared sandbox for template {template}")]
    PoolExhausted { template: String },

    /// The sandbox backend could not be reached or refused the request.
    #[error("sandbox provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The model asked for a tool that is not registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("diff resolution failed for {path}: {message}")]
    DiffResolutionFailed { path: String, message: String },

    /// Another turn holds the project lock.
    #[error("project {0} is busy")]
    LockBusy(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("chat not found: {0}")]
    ChatNotFound(String),

    #[error("unknown stack: {0}")]
    UnknownStack(String),

    #[error("agent stopped after {0} steps")]
    MaxSteps(usize),

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn diff_failed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DiffResolutionFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn pool_exhausted(template: impl Into<String>) -> Self {
        Self::PoolExhausted {
            template: template.into(),
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::PoolExhausted { .. }
            | CoreError::ProviderUnavailable(_)
            | CoreError::LockBusy(_) => true,
            CoreError::Sandbox(e) => e.is_transient(),
            CoreError::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config at {path}: {message}")]
    InvalidJson { path: String, message: String },

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
