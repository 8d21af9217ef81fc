//! Normalized streaming events.
//!
//! Every adapter turns its vendor wire format into [`StreamEvent`]s:
//!
//! - OpenAI sends tool calls as fragments keyed by `index` and only says they
//!   are finished through `finish_reason`, so it emits `ToolCallDelta`s and a
//!   `TurnDone`.
//! - Anthropic opens and closes a content block per tool call, so it emits
//!   `ToolCallDelta`s followed by `ToolCallComplete` for that block.
//!
//! Consumers concatenate deltas per index and treat every open call as
//! complete once `TurnDone` arrives.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Assistant text.
    ContentDelta(String),
    /// Reasoning text, shown to viewers but not fed to the diff applier.
    ThinkingDelta(String),
    /// A fragment of tool call `index`. `id` and `name` arrive once, usually
    /// on the first fragment; `arguments` is a slice of a JSON document.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// No more fragments will arrive for tool call `index`.
    ToolCallComplete { index: usize },
    /// The provider finished this request.
    TurnDone {
        finish_reason: FinishReason,
        usage: Usage,
    },
}

impl StreamEvent {
    pub fn content(delta: impl Into<String>) -> Self {
        Self::ContentDelta(delta.into())
    }

    pub fn done(finish_reason: FinishReason) -> Self {
        Self::TurnDone {
            finish_reason,
            usage: Usage::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    EndTurn,
    MaxTokens,
    ToolUse,
    ContentFilter,
    Other,
}

impl FinishReason {
    pub fn from_anthropic(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop_sequence" => Self::EndTurn,
            "max_tokens" => Self::MaxTokens,
            "tool_use" => Self::ToolUse,
            _ => Self::Other,
        }
    }

    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "stop" => Self::EndTurn,
            "length" => Self::MaxTokens,
            "tool_calls" | "function_call" => Self::ToolUse,
            "content_filter" => Self::ContentFilter,
            _ => Self::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_merge() {
        let mut usage = Usage::new(100, 50);
        usage.merge(&Usage::new(20, 10));
        assert_eq!(usage.total(), 180);
    }

    #[test]
    fn test_finish_reason_parsing() {
        assert_eq!(FinishReason::from_openai("tool_calls"), FinishReason::ToolUse);
        assert_eq!(FinishReason::from_openai("stop"), FinishReason::EndTurn);
        assert_eq!(FinishReason::from_anthropic("tool_use"), FinishReason::ToolUse);
        assert_eq!(FinishReason::from_anthropic("refusal"), FinishReason::Other);
    }
}
