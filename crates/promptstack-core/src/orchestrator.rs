//! One project's live session: its viewers, its sandbox and its agent turns.
//!
//! A [`ProjectOrchestrator`] exists while somebody is looking at the
//! project. The first attached viewer starts a background task that boots
//! the sandbox and keeps it alive. Agent turns are serialized across every
//! chat of the project because they share one filesystem.

use crate::agent::{suggest_follow_ups, system_prompt, to_model_messages, PromptContext};
use crate::diff::StreamingDiffApplier;
use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::{ProjectWorkspace, SandboxLifecycle};
use crate::normalizer::{StreamNormalizer, TurnEvent};
use crate::retry::sleep_with_cancel;
use crate::tools::project_tools;
use futures::future::join_all;
use futures::StreamExt;
use promptstack_protocol::{BoxedViewer, ChatMessage, ClientMessage, SandboxState, ViewerEvent};
use promptstack_tools::{ToolContext, ToolEvent, ToolRegistry};
use promptstack_util::TimingGuard;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest commit subject taken from a user prompt.
const COMMIT_SUBJECT_CHARS: usize = 72;

/// Per-chat agent state, released when the chat's last viewer leaves.
struct ChatAgent {
    applier: Arc<tokio::sync::Mutex<StreamingDiffApplier>>,
    tools: ToolRegistry,
}

#[derive(Default)]
struct Viewers {
    by_chat: HashMap<String, Vec<BoxedViewer>>,
    idle_since: Option<Instant>,
}

impl Viewers {
    fn count(&self) -> usize {
        self.by_chat.values().map(Vec::len).sum()
    }
}

/// What a turn streamed before it ended, kept for the stored message.
#[derive(Default)]
struct TurnBuffer {
    content: String,
    thinking: String,
    navigate_to: Option<String>,
}

pub struct ProjectOrchestrator {
    project_id: String,
    engine: Engine,
    lifecycle: Arc<SandboxLifecycle>,
    viewers: Mutex<Viewers>,
    agents: Mutex<HashMap<String, Arc<ChatAgent>>>,
    turn_lock: tokio::sync::Mutex<()>,
    /// Last state delivered to viewers.
    announced: watch::Sender<SandboxState>,
    /// Orders status deliveries.
    announce_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProjectOrchestrator {
    pub async fn new(engine: Engine, project_id: &str) -> CoreResult<Arc<Self>> {
        let project = engine.projects().get(project_id).await?;
        let lifecycle = Arc::new(engine.lifecycle_for(&project)?);
        let (announced, _) = watch::channel(lifecycle.state());
        Ok(Arc::new(Self {
            project_id: project.project_id,
            engine,
            lifecycle,
            viewers: Mutex::new(Viewers {
                by_chat: HashMap::new(),
                idle_since: Some(Instant::now()),
            }),
            agents: Mutex::new(HashMap::new()),
            turn_lock: tokio::sync::Mutex::new(()),
            announced,
            announce_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn lifecycle(&self) -> &Arc<SandboxLifecycle> {
        &self.lifecycle
    }

    pub fn state(&self) -> SandboxState {
        self.lifecycle.state()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers().count()
    }

    pub fn is_killed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn viewers(&self) -> MutexGuard<'_, Viewers> {
        self.viewers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<String, Arc<ChatAgent>>> {
        self.agents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a viewer of `chat_id`. It immediately receives the current
    /// status. The first viewer ever starts the sandbox.
    pub async fn attach(self: &Arc<Self>, chat_id: &str, viewer: BoxedViewer) {
        let delivered = {
            let _order = self.announce_lock.lock().await;
            {
                let mut viewers = self.viewers();
                viewers
                    .by_chat
                    .entry(chat_id.to_string())
                    .or_default()
                    .push(viewer.clone());
                viewers.idle_since = None;
            }
            let state = *self.announced.borrow();
            self.send_bounded(&viewer, &self.status_event(state)).await
        };
        info!(project_id = %self.project_id, chat_id, viewer = viewer.id(), "Viewer attached");
        if !delivered {
            self.detach(chat_id, viewer.id());
            return;
        }

        if !self.started.swap(true, Ordering::SeqCst) {
            let this = self.clone();
            let task = tokio::spawn(async move { this.supervise().await });
            self.tasks().push(task);
        }
    }

    /// Unregister a viewer. A chat without viewers loses its agent; a turn
    /// already running for it still completes.
    pub fn detach(&self, chat_id: &str, viewer_id: &str) {
        let chat_empty = {
            let mut viewers = self.viewers();
            let empty = match viewers.by_chat.get_mut(chat_id) {
                Some(list) => {
                    list.retain(|v| v.id() != viewer_id);
                    list.is_empty()
                }
                None => true,
            };
            if empty {
                viewers.by_chat.remove(chat_id);
            }
            if viewers.by_chat.is_empty() && viewers.idle_since.is_none() {
                viewers.idle_since = Some(Instant::now());
            }
            empty
        };
        if chat_empty && self.agents().remove(chat_id).is_some() {
            debug!(project_id = %self.project_id, chat_id, "Released chat agent");
        }
        debug!(project_id = %self.project_id, chat_id, viewer = viewer_id, "Viewer detached");
    }

    /// No viewers for at least `timeout` and no turn in flight.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let idle = {
            let viewers = self.viewers();
            viewers.by_chat.is_empty()
                && viewers.idle_since.is_some_and(|since| since.elapsed() >= timeout)
        };
        idle && self.turn_lock.try_lock().is_ok()
    }

    /// Close every viewer, cancel in-flight work and stop the sandbox.
    pub async fn kill(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(project_id = %self.project_id, "Killing project orchestrator");
        self.cancel.cancel();
        for task in self.tasks().drain(..) {
            task.abort();
        }

        let viewers: Vec<BoxedViewer> = {
            let mut viewers = self.viewers();
            let drained = viewers.by_chat.drain().flat_map(|(_, list)| list).collect();
            viewers.idle_since = Some(Instant::now());
            drained
        };
        join_all(viewers.iter().map(|v| v.close())).await;
        self.agents().clear();

        if let Err(e) = self.lifecycle.terminate().await {
            warn!(project_id = %self.project_id, error = %e, "Failed to terminate sandbox");
        }
    }

    /// Boot the sandbox, then watch it and reboot whenever it dies.
    async fn supervise(self: Arc<Self>) {
        let interval = self.engine.config().sandbox.supervise_interval();
        let retry = self.engine.config().sandbox.waiting_retry();
        loop {
            if !self.boot().await {
                if self.cancel.is_cancelled() {
                    return;
                }
                self.lifecycle.mark_offline();
                self.announce(SandboxState::Offline).await;
                if !sleep_with_cancel(retry, &self.cancel).await {
                    return;
                }
                continue;
            }

            loop {
                if !sleep_with_cancel(interval, &self.cancel).await {
                    return;
                }
                if self.lifecycle.state().is_busy() {
                    continue;
                }
                if !self.lifecycle.check_alive().await {
                    warn!(project_id = %self.project_id, "Sandbox died, rebooting");
                    self.lifecycle.mark_offline();
                    self.announce(SandboxState::Offline).await;
                    break;
                }
            }
        }
    }

    /// Drive the lifecycle to `Ready`, broadcasting every state. Returns
    /// false if it gave up.
    async fn boot(&self) -> bool {
        let stream = self.lifecycle.clone().ensure_ready(self.cancel.child_token());
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            match item {
                Ok(state) => {
                    debug!(project_id = %self.project_id, state = %state, "Boot progress");
                    self.announce(state).await;
                }
                Err(CoreError::Cancelled) => return false,
                Err(e) => {
                    error!(project_id = %self.project_id, error = %e, "Sandbox boot failed");
                    return false;
                }
            }
        }
        self.lifecycle.state() == SandboxState::Ready
    }

    /// Send `event` to every viewer of the project. A viewer that fails is
    /// detached; the others still receive the event.
    pub async fn broadcast(&self, event: &ViewerEvent) {
        let targets: Vec<(String, BoxedViewer)> = {
            let viewers = self.viewers();
            viewers
                .by_chat
                .iter()
                .flat_map(|(chat, list)| list.iter().map(move |v| (chat.clone(), v.clone())))
                .collect()
        };
        self.deliver(targets, event).await;
    }

    /// Send `event` to the viewers of one chat.
    pub async fn send_to_chat(&self, chat_id: &str, event: &ViewerEvent) {
        let targets: Vec<(String, BoxedViewer)> = {
            let viewers = self.viewers();
            viewers
                .by_chat
                .get(chat_id)
                .map(|list| list.iter().map(|v| (chat_id.to_string(), v.clone())).collect())
                .unwrap_or_default()
        };
        self.deliver(targets, event).await;
    }

    async fn deliver(&self, targets: Vec<(String, BoxedViewer)>, event: &ViewerEvent) {
        let results = join_all(targets.iter().map(|(_, v)| self.send_bounded(v, event))).await;
        for ((chat_id, viewer), delivered) in targets.iter().zip(results) {
            if !delivered {
                warn!(project_id = %self.project_id, chat_id = %chat_id, viewer = viewer.id(), event = event.for_type(), "Dropping failed viewer");
                self.detach(chat_id, viewer.id());
            }
        }
    }

    /// Send one event, giving up on a viewer that stops taking them.
    async fn send_bounded(&self, viewer: &BoxedViewer, event: &ViewerEvent) -> bool {
        let limit = self.engine.config().orchestrator.viewer_send_timeout();
        match tokio::time::timeout(limit, viewer.send(event)).await {
            Ok(result) => result.is_ok(),
            Err(_) => {
                warn!(project_id = %self.project_id, viewer = viewer.id(), "Viewer send timed out");
                false
            }
        }
    }

    fn status_event(&self, state: SandboxState) -> ViewerEvent {
        let mut event = self.lifecycle.status_event();
        if let ViewerEvent::Status { sandbox_state, .. } = &mut event {
            *sandbox_state = state;
        }
        event
    }

    /// Broadcast `state` with the current tunnels and file tree. Deliveries
    /// are ordered, so viewers see states in the order they were entered.
    async fn announce(&self, state: SandboxState) {
        let _order = self.announce_lock.lock().await;
        self.broadcast(&self.status_event(state)).await;
        self.announced.send_replace(state);
    }

    /// Wait until viewers have been told the sandbox is `Ready`.
    async fn wait_announced_ready(&self, cancel: &CancellationToken) -> CoreResult<()> {
        let mut rx = self.announced.subscribe();
        tokio::select! {
            result = rx.wait_for(|s| *s == SandboxState::Ready) => {
                result.map(|_| ()).map_err(|_| CoreError::Cancelled)
            }
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
        }
    }

    fn agent_for(&self, chat_id: &str) -> Arc<ChatAgent> {
        self.agents()
            .entry(chat_id.to_string())
            .or_insert_with(|| {
                let workspace: Arc<dyn ProjectWorkspace> = self.lifecycle.clone();
                let applier = Arc::new(tokio::sync::Mutex::new(StreamingDiffApplier::new(
                    workspace,
                    self.engine.resolver().clone(),
                    self.engine.diff_policy().clone(),
                )));
                let tools = project_tools(
                    self.lifecycle.clone(),
                    applier.clone(),
                    self.engine.browser().clone(),
                );
                Arc::new(ChatAgent { applier, tools })
            })
            .clone()
    }

    /// Handle one user prompt. Turns of the same project run one at a time;
    /// a prompt arriving mid-turn waits for the lock. Whatever happens, the
    /// project ends up `Ready` again.
    pub async fn on_message(&self, chat_id: &str, message: ClientMessage) -> CoreResult<()> {
        let _turn = match self.turn_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!(project_id = %self.project_id, chat_id, reason = %CoreError::LockBusy(self.project_id.clone()), "Message queued behind running turn");
                self.turn_lock.lock().await
            }
        };
        let cancel = self.cancel.child_token();
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let user = self
            .engine
            .chats()
            .append_message(chat_id, ChatMessage::from(message))
            .await?;
        self.send_to_chat(chat_id, &chat_update(chat_id, user.clone(), None, None))
            .await;

        let agent = self.agent_for(chat_id);
        let mut buffer = TurnBuffer::default();
        let _timing = TimingGuard::new("turn", format!("{}/{}", self.project_id, chat_id))
            .with_warn_threshold(Duration::from_secs(300));
        let result = self
            .run_turn(chat_id, &agent, &user.content, &mut buffer, &cancel)
            .await;

        if let Err(e) = &result {
            error!(project_id = %self.project_id, chat_id, error = %e, "Turn failed");
            agent.applier.lock().await.discard();
            if !matches!(e, CoreError::Cancelled) {
                self.store_failed_turn(chat_id, buffer, e).await;
            }
        }
        self.lifecycle.force_ready();
        self.announce(self.lifecycle.state()).await;
        result
    }

    async fn run_turn(
        &self,
        chat_id: &str,
        agent: &ChatAgent,
        prompt: &str,
        buffer: &mut TurnBuffer,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        loop {
            self.wait_announced_ready(cancel).await?;
            if self.lifecycle.transition(SandboxState::Working) {
                break;
            }
            // Sandbox left Ready before viewers heard about it.
            if !sleep_with_cancel(Duration::from_millis(50), cancel).await {
                return Err(CoreError::Cancelled);
            }
        }
        self.announce(SandboxState::Working).await;

        let config = self.engine.config();
        let project = self.engine.projects().get(&self.project_id).await?;
        let history = self.engine.chats().messages(chat_id).await?;
        let prompt_ctx = PromptContext {
            project_name: project.name,
            sandbox_ready: self.lifecycle.handle().is_some(),
            stack_prompt: self.lifecycle.template().prompt.clone(),
            file_paths: self.lifecycle.file_paths(),
        };

        agent.applier.lock().await.reset();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let ctx = ToolContext::new(&self.project_id, chat_id)
            .with_abort(cancel.clone())
            .with_events(event_tx);
        let normalizer = StreamNormalizer::new(self.engine.main_model().clone(), agent.tools.clone())
            .with_system(system_prompt(&prompt_ctx))
            .with_max_steps(config.model.max_steps)
            .with_max_tokens(config.model.max_tokens);

        let stream = normalizer.run(to_model_messages(&history), ctx);
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event? {
                TurnEvent::Content(delta) => {
                    buffer.content.push_str(&delta);
                    agent.applier.lock().await.ingest(&delta);
                    self.send_to_chat(chat_id, &ViewerEvent::content_chunk(delta)).await;
                }
                TurnEvent::Thinking(delta) => {
                    buffer.thinking.push_str(&delta);
                    self.send_to_chat(chat_id, &ViewerEvent::thinking_chunk(delta)).await;
                }
                TurnEvent::ToolInvoked { name } => {
                    debug!(project_id = %self.project_id, chat_id, tool = %name, "Tool invoked");
                }
                TurnEvent::Done { steps, usage } => {
                    info!(
                        project_id = %self.project_id,
                        chat_id,
                        steps,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "Agent finished"
                    );
                }
            }
            while let Ok(ToolEvent::NavigateTo(path)) = event_rx.try_recv() {
                buffer.navigate_to = Some(path);
            }
        }
        while let Ok(ToolEvent::NavigateTo(path)) = event_rx.try_recv() {
            buffer.navigate_to = Some(path);
        }

        if self.lifecycle.transition(SandboxState::ApplyingChanges) {
            self.announce(SandboxState::ApplyingChanges).await;
        }
        let outcome = agent
            .applier
            .lock()
            .await
            .apply(&commit_subject(prompt))
            .await?;
        if !outcome.written.is_empty() {
            info!(project_id = %self.project_id, files = outcome.written.len(), "Applied changes");
        }

        let mut content = buffer.content.clone();
        if !outcome.failed.is_empty() {
            content.push_str(&failed_files_note(&outcome.failed));
        }
        let mut reply = ChatMessage::assistant(content);
        if !buffer.thinking.is_empty() {
            reply.thinking = Some(buffer.thinking.clone());
        }
        let reply = self.engine.chats().append_message(chat_id, reply).await?;

        let mut transcript = history;
        transcript.push(reply.clone());
        let follow_ups =
            suggest_follow_ups(self.engine.fast_model().as_ref(), &prompt_ctx, &transcript).await;
        self.send_to_chat(
            chat_id,
            &chat_update(chat_id, reply, Some(follow_ups), buffer.navigate_to.clone()),
        )
        .await;

        self.lifecycle.transition(SandboxState::Ready);
        Ok(())
    }

    /// Keep what streamed before the failure, followed by the error.
    async fn store_failed_turn(&self, chat_id: &str, buffer: TurnBuffer, e: &CoreError) {
        let mut content = buffer.content;
        if !content.is_empty() {
            content.push_str("\n\n");
        }
        content.push_str(&format!("Error: {e}"));
        let mut reply = ChatMessage::assistant(content);
        if !buffer.thinking.is_empty() {
            reply.thinking = Some(buffer.thinking);
        }
        match self.engine.chats().append_message(chat_id, reply).await {
            Ok(reply) => {
                self.send_to_chat(chat_id, &chat_update(chat_id, reply, None, buffer.navigate_to))
                    .await;
            }
            Err(store_err) => {
                error!(project_id = %self.project_id, chat_id, error = %store_err, "Failed to store failed turn");
            }
        }
    }
}

impl Drop for ProjectOrchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn chat_update(
    chat_id: &str,
    message: ChatMessage,
    follow_ups: Option<Vec<String>>,
    navigate_to: Option<String>,
) -> ViewerEvent {
    ViewerEvent::ChatUpdate {
        chat_id: chat_id.to_string(),
        message,
        follow_ups,
        navigate_to,
    }
}

/// First line of the prompt, shortened for a commit message.
fn commit_subject(prompt: &str) -> String {
    let line = prompt.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.is_empty() {
        return "Apply changes".to_string();
    }
    if line.chars().count() <= COMMIT_SUBJECT_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(COMMIT_SUBJECT_CHARS - 3).collect();
    format!("{}...", cut.trim_end())
}

fn failed_files_note(failed: &[(String, String)]) -> String {
    let mut note = String::from("\n\nThese files could not be applied:");
    for (path, error) in failed {
        note.push_str(&format!("\n- {path}: {error}"));
    }
    note
}
