//! Tools an agent can call during a turn.
//!
//! A tool is a named, schema-described async function. Tools that need a
//! live sandbox are defined next to the sandbox lifecycle in
//! `promptstack-core`; this crate holds the interface, the registry and the
//! tools that work without one.

pub mod docs;
pub mod error;
pub mod navigate;
pub mod registry;

pub use docs::ReadDocsTool;
pub use error::{ToolError, ToolResult};
pub use navigate::NavigateTool;
pub use registry::ToolRegistry;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Side effects a tool reports back to the turn that invoked it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEvent {
    /// Viewers should open this path in the preview.
    NavigateTo(String),
}

/// Context passed to every invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub project_id: String,
    pub chat_id: String,
    pub abort: CancellationToken,
    pub event_tx: Option<mpsc::UnboundedSender<ToolEvent>>,
}

impl ToolContext {
    pub fn new(project_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            chat_id: chat_id.into(),
            abort: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ToolEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Report an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: ToolEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub title: String,
    /// Text handed back to the model as the tool result.
    pub output: String,
    pub metadata: Value,
}

impl ToolOutput {
    pub fn new(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn json_schema(&self) -> Value;

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutput>;
}

pub type BoxedTool = Arc<dyn Tool>;

/// Deserialize tool arguments, mapping failures to `Validation`.
pub fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> ToolResult<T> {
    serde_json::from_value(args).map_err(|e| ToolError::validation(format!("invalid arguments: {e}")))
}
