//! Language model access for promptstack.
//!
//! Two adapters are provided, both streaming:
//! - OpenAI chat completions (and compatible endpoints)
//! - Anthropic messages
//!
//! Both produce the same [`StreamEvent`] sequence so the agent loop never
//! sees a vendor wire format.

pub mod anthropic;
pub mod error;
pub mod message;
pub mod model;
pub mod openai;
pub mod stream;

pub use anthropic::AnthropicProvider;
pub use error::{ProviderError, ProviderResult};
pub use message::{ContentPart, Message, Role};
pub use model::ModelInfo;
pub use openai::OpenAiProvider;
pub use stream::{FinishReason, StreamEvent, Usage};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub abort: Option<tokio_util::sync::CancellationToken>,
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

pub type EventStream = BoxStream<'static, ProviderResult<StreamEvent>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start one streaming request. Errors before the first byte are
    /// returned directly; errors mid-stream arrive as stream items.
    async fn generate(
        &self,
        messages: Vec<Message>,
        options: GenerateOptions,
    ) -> ProviderResult<EventStream>;

    fn model_info(&self) -> &ModelInfo;

    fn provider_id(&self) -> &str {
        &self.model_info().provider_id
    }
}

pub type BoxedLanguageModel = Arc<dyn LanguageModel>;

/// Build an adapter by provider id. `base_url` overrides the vendor endpoint.
pub fn create_model(
    provider_id: &str,
    model_id: &str,
    api_key: Option<&str>,
    base_url: Option<&str>,
) -> ProviderResult<BoxedLanguageModel> {
    let api_key = api_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ProviderError::missing_api_key(provider_id))?;
    let model = ModelInfo::new(provider_id, model_id);
    match provider_id {
        "openai" => {
            let url = base_url.unwrap_or(openai::OPENAI_API_URL);
            Ok(Arc::new(OpenAiProvider::with_base_url(api_key, url, model)?))
        }
        "anthropic" => {
            let url = base_url.unwrap_or(anthropic::ANTHROPIC_API_URL);
            Ok(Arc::new(AnthropicProvider::with_base_url(api_key, url, model)?))
        }
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

/// One-shot, tool-free completion: system + user prompt in, full text out.
pub async fn complete(
    model: &dyn LanguageModel,
    system: &str,
    user: &str,
    options: GenerateOptions,
) -> ProviderResult<String> {
    let options = GenerateOptions {
        system: Some(system.to_string()),
        tools: Vec::new(),
        temperature: options.temperature.or(Some(0.0)),
        ..options
    };
    let mut stream = model.generate(vec![Message::user(user)], options).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        if let StreamEvent::ContentDelta(delta) = event? {
            text.push_str(&delta);
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_model_requires_key() {
        let err = create_model("openai", "gpt-4o", None, None).err().unwrap();
        assert!(matches!(err, ProviderError::MissingApiKey(_)));
        let err = create_model("openai", "gpt-4o", Some(""), None).err().unwrap();
        assert!(matches!(err, ProviderError::MissingApiKey(_)));
    }

    #[test]
    fn test_create_model_by_provider() {
        let model = create_model("anthropic", "claude-sonnet-4", Some("k"), None).unwrap();
        assert_eq!(model.provider_id(), "anthropic");
        assert_eq!(model.model_info().id, "claude-sonnet-4");
        assert!(matches!(
            create_model("cohere", "x", Some("k"), None).err().unwrap(),
            ProviderError::UnknownProvider(_)
        ));
    }
}
