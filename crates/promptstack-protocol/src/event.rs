//! Events pushed to viewers.

use crate::{ChatMessage, Role, SandboxState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A server-to-viewer event, tagged with `for_type`.
///
/// `Status` is broadcast to every viewer of a project; `ChatUpdate` and
/// `ChatChunk` go to the viewers of one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "for_type", rename_all = "snake_case")]
pub enum ViewerEvent {
    Status {
        project_id: String,
        sandbox_state: SandboxState,
        /// Exposed port to public URL.
        tunnels: BTreeMap<u16, String>,
        file_paths: Vec<String>,
    },
    ChatUpdate {
        chat_id: String,
        message: ChatMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        follow_ups: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        navigate_to: Option<String>,
    },
    ChatChunk {
        role: Role,
        content_delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking_delta: Option<String>,
    },
}

impl ViewerEvent {
    pub fn content_chunk(delta: impl Into<String>) -> Self {
        ViewerEvent::ChatChunk {
            role: Role::Assistant,
            content_delta: delta.into(),
            thinking_delta: None,
        }
    }

    pub fn thinking_chunk(delta: impl Into<String>) -> Self {
        ViewerEvent::ChatChunk {
            role: Role::Assistant,
            content_delta: String::new(),
            thinking_delta: Some(delta.into()),
        }
    }

    pub fn for_type(&self) -> &'static str {
        match self {
            ViewerEvent::Status { .. } => "status",
            ViewerEvent::ChatUpdate { .. } => "chat_update",
            ViewerEvent::ChatChunk { .. } => "chat_chunk",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_wire_shape() {
        let event = ViewerEvent::Status {
            project_id: "prj_1".into(),
            sandbox_state: SandboxState::Ready,
            tunnels: BTreeMap::from([(3000, "http://localhost:49152".to_string())]),
            file_paths: vec!["frontend/src/app/page.js".into()],
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "for_type": "status",
                "project_id": "prj_1",
                "sandbox_state": "READY",
                "tunnels": {"3000": "http://localhost:49152"},
                "file_paths": ["frontend/src/app/page.js"],
            })
        );
    }

    #[test]
    fn chunk_wire_shape() {
        let value = serde_json::to_value(ViewerEvent::content_chunk("hi")).unwrap();
        assert_eq!(
            value,
            json!({"for_type": "chat_chunk", "role": "assistant", "content_delta": "hi"})
        );
    }

    #[test]
    fn chat_update_roundtrips_optional_fields() {
        let event = ViewerEvent::ChatUpdate {
            chat_id: "cht_1".into(),
            message: ChatMessage::assistant("ok"),
            follow_ups: Some(vec!["Add a footer".into()]),
            navigate_to: Some("/about".into()),
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: ViewerEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.for_type(), "chat_update");
    }
}
