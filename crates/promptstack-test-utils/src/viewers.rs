//! A viewer connection that records what it is sent.

use async_trait::async_trait;
use promptstack_protocol::{ChatMessage, SandboxState, ViewerClosed, ViewerConnection, ViewerEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Records every event; can be told to fail sends like a dropped socket.
pub struct RecordingViewer {
    id: String,
    events: Mutex<Vec<ViewerEvent>>,
    failing: AtomicBool,
    stalled: AtomicBool,
    closed: AtomicBool,
}

impl RecordingViewer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            events: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn recorded(&self) -> MutexGuard<'_, Vec<ViewerEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make subsequent sends fail.
    pub fn fail_sends(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent sends hang forever, like a client that stopped reading.
    pub fn stall_sends(&self, stall: bool) {
        self.stalled.store(stall, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<ViewerEvent> {
        self.recorded().clone()
    }

    /// Sandbox states from status events, consecutive repeats collapsed.
    pub fn states(&self) -> Vec<SandboxState> {
        let mut states: Vec<SandboxState> = Vec::new();
        for event in self.recorded().iter() {
            if let ViewerEvent::Status { sandbox_state, .. } = event {
                if states.last() != Some(sandbox_state) {
                    states.push(*sandbox_state);
                }
            }
        }
        states
    }

    /// Concatenated assistant content deltas.
    pub fn streamed_content(&self) -> String {
        self.recorded()
            .iter()
            .filter_map(|e| match e {
                ViewerEvent::ChatChunk { content_delta, .. } => Some(content_delta.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Messages from chat updates, in order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.recorded()
            .iter()
            .filter_map(|e| match e {
                ViewerEvent::ChatUpdate { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// The last chat update's follow-ups and navigation target.
    pub fn last_update(&self) -> Option<(Option<Vec<String>>, Option<String>)> {
        self.recorded().iter().rev().find_map(|e| match e {
            ViewerEvent::ChatUpdate {
                follow_ups,
                navigate_to,
                ..
            } => Some((follow_ups.clone(), navigate_to.clone())),
            _ => None,
        })
    }

    /// Poll until a status event with `state` arrives. Returns false on
    /// timeout.
    pub async fn wait_for_state(&self, state: SandboxState, timeout: Duration) -> bool {
        self.wait_until(timeout, |v| v.states().contains(&state)).await
    }

    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ViewerConnection for RecordingViewer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, event: &ViewerEvent) -> Result<(), ViewerClosed> {
        if self.failing.load(Ordering::SeqCst) || self.is_closed() {
            return Err(ViewerClosed);
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.recorded().push(event.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn status(state: SandboxState) -> ViewerEvent {
        ViewerEvent::Status {
            project_id: "prj_1".into(),
            sandbox_state: state,
            tunnels: BTreeMap::new(),
            file_paths: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_states_collapse_repeats() {
        let viewer = RecordingViewer::new("v1");
        for state in [SandboxState::Offline, SandboxState::Building, SandboxState::Building, SandboxState::Ready] {
            viewer.send(&status(state)).await.unwrap();
        }
        viewer.send(&ViewerEvent::content_chunk("hi")).await.unwrap();
        assert_eq!(
            viewer.states(),
            vec![SandboxState::Offline, SandboxState::Building, SandboxState::Ready]
        );
        assert_eq!(viewer.streamed_content(), "hi");
    }

    #[tokio::test]
    async fn test_failing_and_closed_viewers_reject_sends() {
        let viewer = RecordingViewer::new("v1");
        viewer.fail_sends(true);
        assert!(viewer.send(&status(SandboxState::Ready)).await.is_err());
        viewer.fail_sends(false);
        viewer.close().await;
        assert!(viewer.send(&status(SandboxState::Ready)).await.is_err());
        assert!(viewer.events().is_empty());
    }
}
