//! Drives one agent turn against a streaming model.
//!
//! Providers deliver tool calls as fragments keyed by index. The normalizer
//! concatenates them, runs the finished calls against the [`ToolRegistry`],
//! feeds the results back and restarts the model until it answers without
//! calling a tool. Callers only see [`TurnEvent`]s.

use crate::error::{CoreError, CoreResult};
use async_stream::try_stream;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use promptstack_provider::{
    BoxedLanguageModel, ContentPart, GenerateOptions, Message, ProviderError, Role, StreamEvent,
    Usage,
};
use promptstack_tools::{ToolContext, ToolRegistry};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

/// What a turn produces, in generation order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Assistant text.
    Content(String),
    /// Reasoning text.
    Thinking(String),
    ToolInvoked { name: String },
    /// The model finished without requesting more tools.
    Done { steps: usize, usage: Usage },
}

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// A reassembled tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Tool call fragments of one model request, keyed by index.
#[derive(Debug, Default)]
pub struct CallAccumulator {
    calls: BTreeMap<usize, PendingCall>,
}

impl CallAccumulator {
    pub fn push(&mut self, index: usize, id: Option<String>, name: Option<String>, arguments: &str) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            call.id = Some(id);
        }
        if let Some(name) = name {
            call.name.push_str(&name);
        }
        call.arguments.push_str(arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finished calls in index order.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .map(|(index, call)| ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name,
                arguments: call.arguments,
            })
            .collect()
    }
}

fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}

#[derive(Clone)]
pub struct StreamNormalizer {
    model: BoxedLanguageModel,
    tools: ToolRegistry,
    system: Option<String>,
    max_steps: usize,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl StreamNormalizer {
    pub fn new(model: BoxedLanguageModel, tools: ToolRegistry) -> Self {
        Self {
            model,
            tools,
            system: None,
            max_steps: 25,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run the turn. Cancelling `ctx.abort` abandons the in-flight request
    /// and tool calls and ends the stream with [`CoreError::Cancelled`].
    pub fn run(
        &self,
        messages: Vec<Message>,
        ctx: ToolContext,
    ) -> impl Stream<Item = CoreResult<TurnEvent>> + Send + 'static {
        let this = self.clone();
        try_stream! {
            let definitions = this.tools.definitions();
            let mut messages = messages;
            let mut usage = Usage::default();
            let mut steps = 0;
            let mut finished = false;

            while steps < this.max_steps {
                steps += 1;
                debug!(step = steps, messages = messages.len(), "Starting model step");

                let options = GenerateOptions {
                    temperature: this.temperature,
                    max_tokens: this.max_tokens,
                    system: this.system.clone(),
                    tools: definitions.clone(),
                    abort: Some(ctx.abort.clone()),
                };
                let mut stream = this.model.generate(messages.clone(), options).await?;

                let mut text = String::new();
                let mut calls = CallAccumulator::default();
                let mut turn_done = false;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = ctx.abort.cancelled() => None,
                        event = stream.next() => Some(event),
                    };
                    let event = match next {
                        None => {
                            Err::<(), _>(CoreError::Cancelled)?;
                            break;
                        }
                        Some(None) => break,
                        Some(Some(event)) => event?,
                    };
                    match event {
                        StreamEvent::ContentDelta(delta) => {
                            text.push_str(&delta);
                            yield TurnEvent::Content(delta);
                        }
                        StreamEvent::ThinkingDelta(delta) => {
                            yield TurnEvent::Thinking(delta);
                        }
                        StreamEvent::ToolCallDelta { index, id, name, arguments } => {
                            calls.push(index, id, name, &arguments);
                        }
                        StreamEvent::ToolCallComplete { index } => {
                            trace!(index, "Tool call fragments complete");
                        }
                        StreamEvent::TurnDone { finish_reason, usage: step_usage } => {
                            debug!(step = steps, reason = ?finish_reason, input = step_usage.input_tokens, output = step_usage.output_tokens, "Model step finished");
                            usage.merge(&step_usage);
                            turn_done = true;
                            break;
                        }
                    }
                }
                if !turn_done {
                    Err::<(), _>(ProviderError::StreamInterrupted)?;
                }

                let calls = calls.finish();
                if calls.is_empty() {
                    finished = true;
                    break;
                }
                for call in &calls {
                    if !this.tools.contains(&call.name) {
                        warn!(tool = %call.name, "Model requested an unknown tool");
                        Err::<(), _>(CoreError::UnknownTool(call.name.clone()))?;
                    }
                }

                let parsed: Vec<Result<Value, String>> = calls
                    .iter()
                    .map(|c| parse_arguments(&c.arguments).map_err(|e| format!("invalid arguments: {e}")))
                    .collect();

                let mut assistant = Message { role: Role::Assistant, content: Vec::new() };
                if !text.is_empty() {
                    assistant.content.push(ContentPart::text(text));
                }
                for (call, args) in calls.iter().zip(&parsed) {
                    let input = args.clone().unwrap_or_else(|_| Value::Object(Default::default()));
                    assistant.content.push(ContentPart::tool_use(&call.id, &call.name, input));
                }
                messages.push(assistant);

                for call in &calls {
                    yield TurnEvent::ToolInvoked { name: call.name.clone() };
                }
                info!(step = steps, count = calls.len(), "Running tool calls");

                let invocations = calls.iter().zip(parsed).map(|(call, args)| {
                    let tools = &this.tools;
                    let ctx = &ctx;
                    async move {
                        match args {
                            Ok(args) => tools.invoke(&call.name, args, ctx).await.map_err(|e| e.to_string()),
                            Err(e) => Err(e),
                        }
                    }
                });
                let results = tokio::select! {
                    biased;
                    _ = ctx.abort.cancelled() => None,
                    results = join_all(invocations) => Some(results),
                };
                let Some(results) = results else {
                    Err::<(), _>(CoreError::Cancelled)?;
                    break;
                };

                let mut tool_message = Message { role: Role::Tool, content: Vec::new() };
                for (call, result) in calls.iter().zip(results) {
                    let part = match result {
                        Ok(output) => ContentPart::ToolResult {
                            tool_use_id: call.id.clone(),
                            content: output.output,
                            is_error: None,
                        },
                        Err(error) => {
                            debug!(tool = %call.name, error = %error, "Tool call failed");
                            ContentPart::ToolResult {
                                tool_use_id: call.id.clone(),
                                content: format!("Error: {error}"),
                                is_error: Some(true),
                            }
                        }
                    };
                    tool_message.content.push(part);
                }
                messages.push(tool_message);
                yield TurnEvent::Content("\n".to_string());
            }

            if finished {
                yield TurnEvent::Done { steps, usage };
            } else {
                Err::<(), _>(CoreError::MaxSteps(this.max_steps))?;
            }
        }
    }
}
