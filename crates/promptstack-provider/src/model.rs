//! Model metadata.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Provider-side model id, e.g. `gpt-4o`.
    pub id: String,
    /// `openai` or `anthropic`.
    pub provider_id: String,
    /// Default output token cap when a request does not set one.
    pub max_output_tokens: u32,
}

impl ModelInfo {
    pub fn new(provider_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            max_output_tokens: 8192,
        }
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }
}
