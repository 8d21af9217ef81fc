//! OpenAI chat completions adapter.
//!
//! Works against any OpenAI-compatible `/chat/completions` endpoint that
//! streams `data: {...}` lines and ends with `data: [DONE]`.

use crate::{
    error::ProviderError,
    message::{ContentPart, Message, Role},
    model::ModelInfo,
    stream::{FinishReason, StreamEvent, Usage},
    EventStream, GenerateOptions, LanguageModel, ProviderResult, ToolDefinition,
};
use async_stream::try_stream;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    model: ModelInfo,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, model: ModelInfo) -> ProviderResult<Self> {
        Self::with_base_url(api_key, OPENAI_API_URL, model)
    }

    pub fn with_base_url(api_key: &str, base_url: &str, model: ModelInfo) -> ProviderResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| ProviderError::invalid_api_key("openai"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::internal(e.to_string()))?;

        debug!(model = %model.id, base_url = %base_url, "Creating OpenAI provider");
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    fn convert_messages(messages: &[Message], system: Option<&str>) -> Vec<Value> {
        let mut result = Vec::new();
        if let Some(sys) = system {
            result.push(json!({ "role": "system", "content": sys }));
        }

        for msg in messages {
            match msg.role {
                Role::Tool => {
                    for part in &msg.content {
                        if let ContentPart::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } = part
                        {
                            result.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content
                            }));
                        }
                    }
                }
                Role::Assistant => {
                    let mut message = json!({
                        "role": "assistant",
                        "content": convert_content(&msg.content),
                    });
                    if let Some(tool_calls) = convert_tool_calls(&msg.content) {
                        message["tool_calls"] = tool_calls;
                    }
                    result.push(message);
                }
                Role::User | Role::System => {
                    let role = if msg.role == Role::User { "user" } else { "system" };
                    result.push(json!({ "role": role, "content": convert_content(&msg.content) }));
                }
            }
        }
        result
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters
                    }
                })
            })
            .collect()
    }
}

/// A single text part collapses to a plain string; images force the array form.
fn convert_content(parts: &[ContentPart]) -> Value {
    let converted: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentPart::Image { url } => {
                Some(json!({ "type": "image_url", "image_url": { "url": url } }))
            }
            _ => None,
        })
        .collect();

    match converted.as_slice() {
        [] => Value::Null,
        [only] if only.get("text").is_some() => only["text"].clone(),
        _ => Value::Array(converted),
    }
}

fn convert_tool_calls(parts: &[ContentPart]) -> Option<Value> {
    let calls: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolUse { id, name, input } => Some(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": input.to_string() }
            })),
            _ => None,
        })
        .collect();
    (!calls.is_empty()).then_some(Value::Array(calls))
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Events carried by one decoded chunk, in wire order.
fn chunk_events(chunk: &ChatChunk, finish: &mut Option<FinishReason>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for choice in &chunk.choices {
        if let Some(content) = choice.delta.content.as_ref().filter(|c| !c.is_empty()) {
            events.push(StreamEvent::ContentDelta(content.clone()));
        }
        for fragment in choice.delta.tool_calls.iter().flatten() {
            let (name, arguments) = match &fragment.function {
                Some(f) => (f.name.clone(), f.arguments.clone().unwrap_or_default()),
                None => (None, String::new()),
            };
            events.push(StreamEvent::ToolCallDelta {
                index: fragment.index,
                id: fragment.id.clone(),
                name,
                arguments,
            });
        }
        if let Some(reason) = &choice.finish_reason {
            *finish = Some(FinishReason::from_openai(reason));
        }
    }
    events
}

#[async_trait]
impl LanguageModel for OpenAiProvider {
    async fn generate(
        &self,
        messages: Vec<Message>,
        options: GenerateOptions,
    ) -> ProviderResult<EventStream> {
        let request = ChatRequest {
            model: self.model.id.clone(),
            messages: Self::convert_messages(&messages, options.system.as_deref()),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            tools: Self::convert_tools(&options.tools),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        info!(
            model = %self.model.id,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "Sending OpenAI request"
        );
        trace!(request = ?request, "Full request");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "OpenAI request failed");
            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited { retry_after: None });
            }
            return Err(ProviderError::api_error(status.as_u16(), body));
        }

        let byte_stream = response.bytes_stream();
        let abort = options.abort.clone();

        Ok(Box::pin(try_stream! {
            use futures::StreamExt;
            use tokio::io::AsyncBufReadExt;
            use tokio_util::io::StreamReader;

            let reader = StreamReader::new(byte_stream.map(|r| r.map_err(std::io::Error::other)));
            let mut lines = reader.lines();
            let mut finish: Option<FinishReason> = None;
            let mut usage = Usage::default();

            while let Some(line) = lines.next_line().await? {
                if abort.as_ref().is_some_and(|t| t.is_cancelled()) {
                    Err(ProviderError::Cancelled)?;
                }

                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let data = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
                if data == "[DONE]" {
                    break;
                }

                let chunk: ChatChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        trace!(error = %e, data = %data, "Skipping undecodable chunk");
                        continue;
                    }
                };
                if let Some(u) = &chunk.usage {
                    usage = Usage::new(u.prompt_tokens, u.completion_tokens);
                }
                for event in chunk_events(&chunk, &mut finish) {
                    yield event;
                }
            }

            match finish {
                Some(finish_reason) => yield StreamEvent::TurnDone { finish_reason, usage },
                None => Err(ProviderError::StreamInterrupted)?,
            }
        }))
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(lines: &[&str]) -> String {
        lines.iter().map(|l| format!("data: {l}\n\n")).collect()
    }

    async fn collect(server: &MockServer) -> Vec<ProviderResult<StreamEvent>> {
        let provider =
            OpenAiProvider::with_base_url("sk-test", &server.uri(), ModelInfo::new("openai", "gpt-4o"))
                .unwrap();
        let stream = provider
            .generate(vec![Message::user("hi")], GenerateOptions::default())
            .await
            .unwrap();
        stream.collect().await
    }

    #[test]
    fn test_convert_messages_with_tool_round() {
        let messages = vec![
            Message::user("list files"),
            Message {
                role: Role::Assistant,
                content: vec![ContentPart::tool_use("call_1", "run_shell_command", json!({"command": "ls"}))],
            },
            Message::tool_result("call_1", "a.js"),
        ];
        let converted = OpenAiProvider::convert_messages(&messages, Some("be brief"));
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[0]["role"], "system");
        assert_eq!(converted[1]["content"], "list files");
        assert_eq!(converted[2]["content"], Value::Null);
        assert_eq!(converted[2]["tool_calls"][0]["function"]["name"], "run_shell_command");
        assert_eq!(converted[2]["tool_calls"][0]["function"]["arguments"], "{\"command\":\"ls\"}");
        assert_eq!(converted[3]["role"], "tool");
        assert_eq!(converted[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_images_use_array_content() {
        let msg = Message::user("what is this").with_part(ContentPart::image("data:image/png;base64,AA"));
        let converted = OpenAiProvider::convert_messages(&[msg], None);
        assert_eq!(converted[0]["content"][1]["type"], "image_url");
    }

    #[tokio::test]
    async fn test_stream_text_and_index_keyed_tool_calls() {
        let server = MockServer::start().await;
        let body = sse(&[
            r#"{"choices":[{"delta":{"content":"Let me"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"content":" check."},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"run_shell_command","arguments":""}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"comm"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"and\":\"ls\"}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7}}"#,
            "[DONE]",
        ]);
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let events: Vec<StreamEvent> = collect(&server).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(events[0], StreamEvent::content("Let me"));
        assert_eq!(events[1], StreamEvent::content(" check."));
        assert_eq!(
            events[2],
            StreamEvent::ToolCallDelta {
                index: 0,
                id: Some("call_a".into()),
                name: Some("run_shell_command".into()),
                arguments: String::new(),
            }
        );
        let args: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallDelta { arguments, .. } => Some(arguments.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(args, "{\"command\":\"ls\"}");
        assert_eq!(
            events.last().unwrap(),
            &StreamEvent::TurnDone {
                finish_reason: FinishReason::ToolUse,
                usage: Usage::new(12, 7),
            }
        );
    }

    #[tokio::test]
    async fn test_stream_without_finish_is_interrupted() {
        let server = MockServer::start().await;
        let body = sse(&[r#"{"choices":[{"delta":{"content":"par"},"finish_reason":null}]}"#]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let events = collect(&server).await;
        assert!(matches!(
            events.last().unwrap(),
            Err(ProviderError::StreamInterrupted)
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        let provider =
            OpenAiProvider::with_base_url("sk-test", &server.uri(), ModelInfo::new("openai", "gpt-4o"))
                .unwrap();
        let err = provider
            .generate(vec![Message::user("hi")], GenerateOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }
}
