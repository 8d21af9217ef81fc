//! Chat sockets.
//!
//! Each connection is one viewer of one chat. Outbound events go through a
//! bounded channel drained by a writer task. A socket whose channel is full
//! is treated as closed and gets dropped from the fan-out. Inbound
//! prompts are queued to a worker that calls `on_message` one at a time,
//! leaving the read loop free to notice close frames mid-turn.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use promptstack_core::{CoreError, ProjectOrchestrator};
use promptstack_protocol::{ClientMessage, ViewerClosed, ViewerConnection, ViewerEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const OUTBOUND_BUFFER: usize = 256;

/// A [`ViewerConnection`] backed by the writer half of a WebSocket.
pub struct WsViewer {
    id: String,
    tx: mpsc::Sender<Message>,
}

impl WsViewer {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: format!("ws_{}", uuid::Uuid::new_v4().simple()),
            tx,
        }
    }
}

#[async_trait]
impl ViewerConnection for WsViewer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, event: &ViewerEvent) -> Result<(), ViewerClosed> {
        let json = serde_json::to_string(event).map_err(|e| {
            warn!(viewer = %self.id, error = %e, "Failed to encode viewer event");
            ViewerClosed
        })?;
        self.tx.try_send(Message::Text(json.into())).map_err(|e| {
            if matches!(e, mpsc::error::TrySendError::Full(_)) {
                warn!(viewer = %self.id, "Outbound buffer full, dropping viewer");
            }
            ViewerClosed
        })
    }

    async fn close(&self) {
        let _ = self.tx.try_send(Message::Close(None));
    }
}

/// Serve one chat socket until either side closes it.
pub async fn handle_socket(socket: WebSocket, orchestrator: Arc<ProjectOrchestrator>, chat_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let viewer = Arc::new(WsViewer::new(tx));
    let viewer_id = viewer.id().to_string();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    info!(chat_id = %chat_id, viewer = %viewer_id, project_id = %orchestrator.project_id(), "Viewer connected");
    orchestrator.attach(&chat_id, viewer).await;

    let (prompt_tx, mut prompt_rx) = mpsc::unbounded_channel::<ClientMessage>();
    tokio::spawn({
        let orchestrator = orchestrator.clone();
        let chat_id = chat_id.clone();
        async move {
            while let Some(msg) = prompt_rx.recv().await {
                match orchestrator.on_message(&chat_id, msg).await {
                    Ok(()) | Err(CoreError::Cancelled) => {}
                    Err(e) => warn!(chat_id = %chat_id, error = %e, "Turn failed"),
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match parse_client_message(text.as_str()) {
                Ok(msg) => {
                    if prompt_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(chat_id = %chat_id, error = %e, "Invalid client message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(chat_id = %chat_id, error = %e, "Socket read failed");
                break;
            }
        }
    }

    orchestrator.detach(&chat_id, &viewer_id);
    // Queued prompts still run; their results are persisted and reach any
    // other viewer of the chat.
    drop(prompt_tx);
    writer.abort();
    info!(chat_id = %chat_id, viewer = %viewer_id, "Viewer disconnected");
}

fn parse_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}
