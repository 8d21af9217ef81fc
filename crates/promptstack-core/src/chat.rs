//! Chat records and message history.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promptstack_protocol::ChatMessage;
use promptstack_storage::{Storage, StorageExt};
use promptstack_util::Identifier;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub chat_id: String,
    pub project_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence for chats and their messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, project_id: &str, name: &str) -> CoreResult<ChatRecord>;

    async fn find_chat(&self, chat_id: &str) -> CoreResult<Option<ChatRecord>>;

    /// Store a message, assigning an id if it has none. Returns the stored copy.
    async fn append_message(&self, chat_id: &str, message: ChatMessage) -> CoreResult<ChatMessage>;

    /// All messages of a chat, oldest first.
    async fn messages(&self, chat_id: &str) -> CoreResult<Vec<ChatMessage>>;

    async fn get_chat(&self, chat_id: &str) -> CoreResult<ChatRecord> {
        self.find_chat(chat_id)
            .await?
            .ok_or_else(|| CoreError::ChatNotFound(chat_id.to_string()))
    }
}

/// `ChatStore` over a [`Storage`]: `chat/<id>` and `message/<chat>/<msg>`.
#[derive(Clone)]
pub struct StorageChatStore {
    storage: Arc<dyn Storage>,
}

impl StorageChatStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ChatStore for StorageChatStore {
    async fn create_chat(&self, project_id: &str, name: &str) -> CoreResult<ChatRecord> {
        let chat = ChatRecord {
            chat_id: Identifier::chat(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.storage.write(&["chat", &chat.chat_id], &chat).await?;
        Ok(chat)
    }

    async fn find_chat(&self, chat_id: &str) -> CoreResult<Option<ChatRecord>> {
        Ok(self.storage.read(&["chat", chat_id]).await?)
    }

    async fn append_message(&self, chat_id: &str, message: ChatMessage) -> CoreResult<ChatMessage> {
        let message = match message.id {
            Some(_) => message,
            None => message.with_id(Identifier::message()),
        };
        let id = message.id.clone().unwrap_or_default();
        self.storage.write(&["message", chat_id, &id], &message).await?;
        Ok(message)
    }

    async fn messages(&self, chat_id: &str) -> CoreResult<Vec<ChatMessage>> {
        // Message ids are ascending ULIDs, and listings are key-ordered.
        Ok(self.storage.read_all(&["message", chat_id]).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptstack_storage::MemoryStorage;

    #[tokio::test]
    async fn test_messages_come_back_in_order() {
        let store = StorageChatStore::new(Arc::new(MemoryStorage::new()));
        let chat = store.create_chat("prj_1", "Chat").await.unwrap();
        for i in 0..5 {
            store
                .append_message(&chat.chat_id, ChatMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let contents: Vec<String> = store
            .messages(&chat.chat_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_append_assigns_id_once() {
        let store = StorageChatStore::new(Arc::new(MemoryStorage::new()));
        let stored = store
            .append_message("cht_1", ChatMessage::assistant("hi"))
            .await
            .unwrap();
        assert!(stored.id.as_deref().unwrap().starts_with("msg_"));
        let again = store.append_message("cht_1", stored.clone()).await.unwrap();
        assert_eq!(again.id, stored.id);
        assert_eq!(store.messages("cht_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_chat() {
        let store = StorageChatStore::new(Arc::new(MemoryStorage::new()));
        assert!(matches!(
            store.get_chat("cht_missing").await,
            Err(CoreError::ChatNotFound(_))
        ));
    }
}
