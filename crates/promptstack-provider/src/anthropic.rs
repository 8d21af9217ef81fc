//! Anthropic Messages API adapter.

use crate::{
    error::ProviderError,
    message::{split_data_url, ContentPart, Message, Role},
    model::ModelInfo,
    stream::{FinishReason, StreamEvent, Usage},
    EventStream, GenerateOptions, LanguageModel, ProviderResult, ToolDefinition,
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use tokio::io::AsyncBufReadExt;
use tokio_util::bytes::Buf;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    model: ModelInfo,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: ModelInfo) -> ProviderResult<Self> {
        Self::with_base_url(api_key, ANTHROPIC_API_URL, model)
    }

    pub fn with_base_url(api_key: &str, base_url: &str, model: ModelInfo) -> ProviderResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key)
                .map_err(|_| ProviderError::invalid_api_key("anthropic"))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::internal(e.to_string()))?;

        debug!(model = %model.id, "Creating Anthropic provider");
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    /// System messages fold into the top-level `system` field; tool results
    /// travel as user turns.
    fn convert_messages(messages: &[Message], system: Option<&str>) -> (Option<String>, Vec<Value>) {
        let mut system = system.map(str::to_string);
        let mut converted = Vec::new();

        for msg in messages {
            let role = match msg.role {
                Role::System => {
                    let text = msg.text();
                    system = Some(match system {
                        Some(existing) => format!("{existing}\n\n{text}"),
                        None => text,
                    });
                    continue;
                }
                Role::Assistant => "assistant",
                Role::User | Role::Tool => "user",
            };
            let content = convert_content(&msg.content);
            if !content.is_empty() {
                converted.push(json!({ "role": role, "content": content }));
            }
        }

        (system, converted)
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters
                })
            })
            .collect()
    }
}

fn convert_content(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if text.is_empty() => None,
            ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentPart::Image { url } => Some(match split_data_url(url) {
                Some((media_type, data)) => json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": media_type, "data": data }
                }),
                None => json!({
                    "type": "image",
                    "source": { "type": "url", "url": url }
                }),
            }),
            ContentPart::ToolUse { id, name, input } => Some(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input
            })),
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error.unwrap_or(false)
            })),
            // Replaying thinking requires a signature we do not keep.
            ContentPart::Thinking { .. } => None,
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<Value>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
}

#[derive(Debug, Default)]
struct SseEvent {
    event: String,
    data: String,
}

impl SseEvent {
    /// Feed one line with its terminator stripped. A blank line ends the
    /// pending event and hands it back.
    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.event.is_empty() && self.data.is_empty() {
                return None;
            }
            return Some(std::mem::take(self));
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event = name.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data = data.trim().to_string();
        }
        None
    }
}

/// Decode a raw SSE body into normalized events.
///
/// Bytes are split into lines before any UTF-8 decoding, so characters
/// straddling network chunks survive intact.
fn decode_body<S, B>(body: S, abort: Option<CancellationToken>) -> EventStream
where
    S: Stream<Item = std::io::Result<B>> + Send + 'static,
    B: Buf + Send + 'static,
{
    Box::pin(try_stream! {
        let mut lines = StreamReader::new(Box::pin(body)).lines();
        let mut pending = SseEvent::default();
        let mut decoder = Decoder::default();

        while let Some(line) = lines.next_line().await? {
            if abort.as_ref().is_some_and(|t| t.is_cancelled()) {
                Err(ProviderError::Cancelled)?;
            }
            if let Some(event) = pending.feed_line(&line) {
                for out in decoder.decode(&event)? {
                    yield out;
                }
            }
        }
        if let Some(event) = pending.feed_line("") {
            for out in decoder.decode(&event)? {
                yield out;
            }
        }

        if !decoder.done {
            Err(ProviderError::StreamInterrupted)?;
        }
    })
}

/// Per-response decoding state.
#[derive(Debug, Default)]
struct Decoder {
    tool_blocks: HashSet<usize>,
    usage: Usage,
    finish: Option<FinishReason>,
    done: bool,
}

impl Decoder {
    fn decode(&mut self, event: &SseEvent) -> ProviderResult<Vec<StreamEvent>> {
        if event.data.is_empty() {
            return Ok(Vec::new());
        }
        let data: Value = serde_json::from_str(&event.data)?;
        let kind = data["type"].as_str().unwrap_or(event.event.as_str());
        let index = data["index"].as_u64().unwrap_or(0) as usize;

        let mut out = Vec::new();
        match kind {
            "message_start" => {
                if let Some(tokens) = data["message"]["usage"]["input_tokens"].as_u64() {
                    self.usage.input_tokens = tokens as u32;
                }
            }
            "content_block_start" => {
                let block = &data["content_block"];
                if block["type"] == "tool_use" {
                    self.tool_blocks.insert(index);
                    out.push(StreamEvent::ToolCallDelta {
                        index,
                        id: block["id"].as_str().map(str::to_string),
                        name: block["name"].as_str().map(str::to_string),
                        arguments: String::new(),
                    });
                }
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            out.push(StreamEvent::ContentDelta(text.to_string()));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta["thinking"].as_str() {
                            out.push(StreamEvent::ThinkingDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        out.push(StreamEvent::ToolCallDelta {
                            index,
                            id: None,
                            name: None,
                            arguments: delta["partial_json"].as_str().unwrap_or_default().to_string(),
                        });
                    }
                    other => trace!(delta_type = ?other, "Ignoring content delta"),
                }
            }
            "content_block_stop" => {
                if self.tool_blocks.remove(&index) {
                    out.push(StreamEvent::ToolCallComplete { index });
                }
            }
            "message_delta" => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.finish = Some(FinishReason::from_anthropic(reason));
                }
                if let Some(tokens) = data["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = tokens as u32;
                }
            }
            "message_stop" => {
                self.done = true;
                out.push(StreamEvent::TurnDone {
                    finish_reason: self.finish.unwrap_or_default(),
                    usage: self.usage,
                });
            }
            "error" => {
                let message = data["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error")
                    .to_string();
                return Err(match data["error"]["type"].as_str() {
                    Some("overloaded_error") => ProviderError::api_error(529, message),
                    Some("rate_limit_error") => ProviderError::RateLimited { retry_after: None },
                    _ => ProviderError::invalid_response(message),
                });
            }
            _ => {}
        }
        Ok(out)
    }
}

#[async_trait]
impl LanguageModel for AnthropicProvider {
    async fn generate(
        &self,
        messages: Vec<Message>,
        options: GenerateOptions,
    ) -> ProviderResult<EventStream> {
        let (system, messages) = Self::convert_messages(&messages, options.system.as_deref());
        let request = MessagesRequest {
            model: self.model.id.clone(),
            messages,
            max_tokens: options.max_tokens.unwrap_or(self.model.max_output_tokens),
            system,
            temperature: options.temperature,
            tools: Self::convert_tools(&options.tools),
            stream: true,
        };

        info!(
            model = %self.model.id,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "Sending Anthropic request"
        );

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Anthropic request failed");
            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited { retry_after: None });
            }
            return Err(ProviderError::api_error(status.as_u16(), body));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(decode_body(body, options.abort.clone()))
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(events: &[(&str, Value)]) -> String {
        events
            .iter()
            .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
            .collect()
    }

    #[test]
    fn test_convert_messages_folds_system_and_tool_results() {
        let messages = vec![
            Message::system("extra rules"),
            Message::user("hi").with_part(ContentPart::image("data:image/png;base64,AAAA")),
            Message::tool_result("toolu_1", "ok"),
        ];
        let (system, converted) = AnthropicProvider::convert_messages(&messages, Some("base"));
        assert_eq!(system.as_deref(), Some("base\n\nextra rules"));
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0]["content"][1]["source"]["media_type"], "image/png");
        assert_eq!(converted[1]["role"], "user");
        assert_eq!(converted[1]["content"][0]["type"], "tool_result");
    }

    #[test]
    fn test_feed_line_ends_event_on_blank_line() {
        let mut pending = SseEvent::default();
        assert!(pending.feed_line("event: message_start").is_none());
        assert!(pending.feed_line("data: {\"type\":\"message_start\"}").is_none());
        let event = pending.feed_line("").unwrap();
        assert_eq!(event.event, "message_start");
        assert_eq!(event.data, "{\"type\":\"message_start\"}");
        assert!(pending.feed_line("").is_none());
    }

    #[tokio::test]
    async fn test_multibyte_text_split_across_chunks() {
        let body = sse(&[
            ("content_block_start", json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}})),
            ("content_block_delta", json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"café"}})),
            ("message_delta", json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}})),
            ("message_stop", json!({"type":"message_stop"})),
        ])
        .replace('\n', "\r\n");
        let raw = body.into_bytes();
        // Cut between the two bytes of 'é'.
        let split = raw.windows(2).position(|w| w == [0xC3, 0xA9]).unwrap() + 1;
        let (head, tail) = raw.split_at(split);
        let chunks = vec![
            Ok::<_, std::io::Error>(std::io::Cursor::new(head.to_vec())),
            Ok(std::io::Cursor::new(tail.to_vec())),
        ];

        let events: Vec<StreamEvent> = decode_body(futures::stream::iter(chunks), None)
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(events[0], StreamEvent::content("café"));
        assert!(matches!(events.last(), Some(StreamEvent::TurnDone { .. })));
    }

    #[tokio::test]
    async fn test_stream_emits_tool_complete_per_block() {
        let server = MockServer::start().await;
        let body = sse(&[
            ("message_start", json!({"type":"message_start","message":{"usage":{"input_tokens":20}}})),
            ("content_block_start", json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}})),
            ("content_block_delta", json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking."}})),
            ("content_block_stop", json!({"type":"content_block_stop","index":0})),
            ("content_block_start", json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"run_shell_command","input":{}}})),
            ("content_block_delta", json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\":"}})),
            ("content_block_delta", json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"ls\"}"}})),
            ("content_block_stop", json!({"type":"content_block_stop","index":1})),
            ("message_delta", json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}})),
            ("message_stop", json!({"type":"message_stop"})),
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url(
            "key",
            &server.uri(),
            ModelInfo::new("anthropic", "claude-sonnet-4-5"),
        )
        .unwrap();
        let events: Vec<StreamEvent> = provider
            .generate(vec![Message::user("hi")], GenerateOptions::default())
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::content("Checking."),
                StreamEvent::ToolCallDelta {
                    index: 1,
                    id: Some("toolu_1".into()),
                    name: Some("run_shell_command".into()),
                    arguments: String::new(),
                },
                StreamEvent::ToolCallDelta {
                    index: 1,
                    id: None,
                    name: None,
                    arguments: "{\"command\":".into(),
                },
                StreamEvent::ToolCallDelta {
                    index: 1,
                    id: None,
                    name: None,
                    arguments: "\"ls\"}".into(),
                },
                StreamEvent::ToolCallComplete { index: 1 },
                StreamEvent::TurnDone {
                    finish_reason: FinishReason::ToolUse,
                    usage: Usage::new(20, 9),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_overloaded_error_event_is_retryable() {
        let server = MockServer::start().await;
        let body = sse(&[(
            "error",
            json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}),
        )]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::with_base_url(
            "key",
            &server.uri(),
            ModelInfo::new("anthropic", "claude-sonnet-4-5"),
        )
        .unwrap();
        let results: Vec<_> = provider
            .generate(vec![Message::user("hi")], GenerateOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(results[0].as_ref().unwrap_err().is_retryable());
    }
}
