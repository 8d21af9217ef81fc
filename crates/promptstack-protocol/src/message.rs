//! Chat messages as stored and as sent to viewers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Inline image attached to a user message, as a data URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatImage {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ChatImage>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            thinking: None,
            images: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A prompt sent by a viewer over its chat socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub content: String,
    #[serde(default)]
    pub images: Vec<ChatImage>,
}

impl From<ClientMessage> for ChatMessage {
    fn from(msg: ClientMessage) -> Self {
        ChatMessage {
            images: msg.images,
            ..ChatMessage::user(msg.content)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_images_optional() {
        let msg: ClientMessage = serde_json::from_str(r#"{"content":"add a navbar"}"#).unwrap();
        assert!(msg.images.is_empty());
        let chat: ChatMessage = msg.into();
        assert_eq!(chat.role, Role::User);
        assert_eq!(chat.content, "add a navbar");
    }

    #[test]
    fn chat_message_omits_empty_fields() {
        let json = serde_json::to_value(ChatMessage::assistant("done")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "done"}));
    }
}
