//! A language model that replays scripted streams.

use async_trait::async_trait;
use futures::StreamExt;
use promptstack_provider::{
    EventStream, FinishReason, GenerateOptions, LanguageModel, Message, ModelInfo, ProviderError,
    ProviderResult, StreamEvent,
};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A call to `generate`.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tool_names: Vec<String>,
}

/// Replays one queued response per `generate` call and records the
/// requests it receives. An empty queue is a provider error.
///
/// # Example
///
/// ```rust,ignore
/// let model = ScriptedModel::new();
/// model.push_tool_call("call_1", "run_shell_command", &["{\"command\":", "\"ls\"}"]);
/// model.push_text(&["Listed ", "the files."]);
/// ```
pub struct ScriptedModel {
    info: ModelInfo,
    script: Mutex<VecDeque<Vec<StreamEvent>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            info: ModelInfo::new("scripted", "scripted-model"),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep before every event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn script(&self) -> MutexGuard<'_, VecDeque<Vec<StreamEvent>>> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn recorded(&self) -> MutexGuard<'_, Vec<RecordedRequest>> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue a plain answer streamed as `chunks`.
    pub fn push_text(&self, chunks: &[&str]) {
        let mut events: Vec<StreamEvent> = chunks.iter().map(|c| StreamEvent::content(*c)).collect();
        events.push(StreamEvent::done(FinishReason::EndTurn));
        self.push_events(events);
    }

    /// Queue a single tool call whose arguments arrive as `fragments`.
    pub fn push_tool_call(&self, id: &str, name: &str, fragments: &[&str]) {
        let mut events = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let first = i == 0;
            events.push(StreamEvent::ToolCallDelta {
                index: 0,
                id: first.then(|| id.to_string()),
                name: first.then(|| name.to_string()),
                arguments: fragment.to_string(),
            });
        }
        events.push(StreamEvent::ToolCallComplete { index: 0 });
        events.push(StreamEvent::done(FinishReason::ToolUse));
        self.push_events(events);
    }

    /// Queue raw events. Leave out `TurnDone` to simulate a dropped stream.
    pub fn push_events(&self, events: Vec<StreamEvent>) {
        self.script().push_back(events);
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script().len()
    }

    /// Messages of every request, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.recorded().iter().map(|r| r.messages.clone()).collect()
    }

    /// System prompts of every request, in order.
    pub fn systems(&self) -> Vec<Option<String>> {
        self.recorded().iter().map(|r| r.system.clone()).collect()
    }

    pub fn recorded_requests(&self) -> Vec<RecordedRequest> {
        self.recorded().clone()
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, messages: Vec<Message>, options: GenerateOptions) -> ProviderResult<EventStream> {
        self.recorded().push(RecordedRequest {
            messages,
            system: options.system.clone(),
            tool_names: options.tools.iter().map(|t| t.name.clone()).collect(),
        });
        let events = self
            .script()
            .pop_front()
            .ok_or_else(|| ProviderError::internal("no scripted response left"))?;

        let delay = self.delay;
        let stream = async_stream::stream! {
            for event in events {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(event);
            }
        };
        Ok(stream.boxed())
    }

    fn model_info(&self) -> &ModelInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order_and_records() {
        let model = ScriptedModel::new();
        model.push_text(&["a", "b"]);
        let options = GenerateOptions {
            system: Some("sys".into()),
            ..Default::default()
        };
        let events: Vec<_> = model
            .generate(vec![Message::user("hi")], options)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], Ok(StreamEvent::TurnDone { .. })));
        assert_eq!(model.systems(), vec![Some("sys".to_string())]);
        assert_eq!(model.remaining(), 0);
    }

    #[tokio::test]
    async fn test_empty_script_is_an_error() {
        let model = ScriptedModel::new();
        assert!(model.generate(Vec::new(), GenerateOptions::default()).await.is_err());
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_tool_call_fragments() {
        let model = ScriptedModel::new();
        model.push_tool_call("call_1", "echo", &["{\"a\":", "1}"]);
        let events: Vec<_> = model
            .generate(Vec::new(), GenerateOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            &events[0],
            Ok(StreamEvent::ToolCallDelta { id: Some(id), .. }) if id == "call_1"
        ));
        assert!(matches!(&events[1], Ok(StreamEvent::ToolCallDelta { id: None, name: None, .. })));
    }
}
