//! The server side of one viewer's connection.

use crate::ViewerEvent;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("viewer connection closed")]
pub struct ViewerClosed;

/// Something events can be pushed to, usually a WebSocket.
#[async_trait]
pub trait ViewerConnection: Send + Sync {
    /// Unique per connection; used to detach it.
    fn id(&self) -> &str;

    async fn send(&self, event: &ViewerEvent) -> Result<(), ViewerClosed>;

    async fn close(&self) {}
}

pub type BoxedViewer = Arc<dyn ViewerConnection>;
