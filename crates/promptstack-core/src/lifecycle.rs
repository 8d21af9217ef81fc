//! Per-project sandbox state machine.
//!
//! [`SandboxLifecycle`] owns one project's sandbox: it claims a prepared
//! volume from the [`PreparedPool`], boots the stack's dev server on it,
//! waits for the public tunnel to answer and then serves commands and file
//! writes against it. Its [`SandboxState`] is published on a watch channel
//! so the orchestrator can relay every transition to viewers.

use crate::config::SandboxConfig;
use crate::error::{CoreError, CoreResult};
use crate::pool::PreparedPool;
use crate::probe::Probe;
use crate::retry::{sleep_with_cancel, Backoff};
use crate::store::{ProjectHandle, ProjectStore};
use async_stream::try_stream;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use futures::Stream;
use promptstack_protocol::{SandboxState, ViewerEvent};
use promptstack_sandbox::{
    shell_escape, ResourceProvider, SandboxError, SandboxHandle, SandboxOutput, SandboxSpec,
    StackTemplate, VolumeRef,
};
use promptstack_util::TimingGuard;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reply to commands issued before the sandbox is up.
pub const BOOTING_MESSAGE: &str = "This environment is still booting up! Try again in a minute.";

const HISTORY_MARKER: &str = "__PROMPTSTACK_HISTORY__";
const FILES_MARKER: &str = "__PROMPTSTACK_FILES__";
/// `read_file` exit code for a missing path.
const MISSING_FILE_EXIT: i64 = 44;
/// Larger batches go through the volume API instead of one inline script.
const INLINE_SCRIPT_LIMIT: usize = 96 * 1024;

/// File access the diff applier needs. Implemented by [`SandboxLifecycle`].
#[async_trait]
pub trait ProjectWorkspace: Send + Sync {
    async fn read_file(&self, path: &str) -> CoreResult<Vec<u8>>;

    /// Write every `(path, content)` pair and commit them together.
    /// Returns the absolute paths written.
    async fn write_files_and_commit(
        &self,
        files: &[(String, String)],
        message: &str,
    ) -> CoreResult<Vec<String>>;
}

#[derive(Debug, Default)]
struct LiveSandbox {
    handle: Option<SandboxHandle>,
    volume: Option<VolumeRef>,
    tunnels: BTreeMap<u16, String>,
    file_paths: Vec<String>,
    history: Vec<String>,
}

pub struct SandboxLifecycle {
    project_id: String,
    template: StackTemplate,
    config: SandboxConfig,
    provider: Arc<dyn ResourceProvider>,
    pool: Arc<PreparedPool>,
    projects: ProjectStore,
    probe: Arc<dyn Probe>,
    state: watch::Sender<SandboxState>,
    live: RwLock<LiveSandbox>,
}

impl SandboxLifecycle {
    pub fn new(
        project_id: impl Into<String>,
        template: StackTemplate,
        config: SandboxConfig,
        provider: Arc<dyn ResourceProvider>,
        pool: Arc<PreparedPool>,
        projects: ProjectStore,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let (state, _) = watch::channel(SandboxState::Offline);
        Self {
            project_id: project_id.into(),
            template,
            config,
            provider,
            pool,
            projects,
            probe,
            state,
            live: RwLock::new(LiveSandbox::default()),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn template(&self) -> &StackTemplate {
        &self.template
    }

    fn live(&self) -> RwLockReadGuard<'_, LiveSandbox> {
        self.live.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_mut(&self) -> RwLockWriteGuard<'_, LiveSandbox> {
        self.live.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SandboxState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SandboxState> {
        self.state.subscribe()
    }

    /// Move to `next` if the state machine allows it. Returns whether the
    /// state changed (or was legally re-entered).
    pub fn transition(&self, next: SandboxState) -> bool {
        let project_id = &self.project_id;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(project_id = %project_id, from = %current, to = %next, "Sandbox state transition");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Return to `Ready` after a turn, whatever step it stopped at.
    pub fn force_ready(&self) -> bool {
        self.state().is_busy() && self.transition(SandboxState::Ready)
    }

    /// Forget the running sandbox and drop to `Offline`. The volume is kept.
    pub fn mark_offline(&self) -> bool {
        {
            let mut live = self.live_mut();
            live.handle = None;
            live.tunnels.clear();
        }
        self.transition(SandboxState::Offline)
    }

    pub fn handle(&self) -> Option<SandboxHandle> {
        self.live().handle.clone()
    }

    pub fn tunnels(&self) -> BTreeMap<u16, String> {
        self.live().tunnels.clone()
    }

    /// Public URL of the stack's dev server.
    pub fn app_url(&self) -> Option<String> {
        self.live().tunnels.get(&self.config.exposed_port).cloned()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.live().file_paths.clone()
    }

    /// `git log --oneline` of the last commits, newest first.
    pub fn history(&self) -> Vec<String> {
        self.live().history.clone()
    }

    pub fn status_event(&self) -> ViewerEvent {
        let live = self.live();
        ViewerEvent::Status {
            project_id: self.project_id.clone(),
            sandbox_state: self.state(),
            tunnels: live.tunnels.clone(),
            file_paths: live.file_paths.clone(),
        }
    }

    /// Bring the sandbox to `Ready`, yielding every state entered on the way.
    ///
    /// An already running and reachable sandbox is reattached directly.
    /// Otherwise the project's volume (claimed from the pool on first boot)
    /// gets a fresh sandbox. Pool exhaustion, transient provider errors and
    /// sandboxes that die while booting all yield `BuildingWaiting` and
    /// retry until `cancel` fires; other errors end the stream.
    pub fn ensure_ready(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = CoreResult<SandboxState>> + Send + 'static {
        try_stream! {
            let project = self.projects.get(&self.project_id).await?;
            if self.reattach(&project).await {
                if self.transition(SandboxState::Ready) {
                    yield SandboxState::Ready;
                }
            } else {
                if self.transition(SandboxState::Building) {
                    yield SandboxState::Building;
                }
                let mut backoff = Backoff::new(self.config.boot_attempts);
                loop {
                    if cancel.is_cancelled() {
                        Err::<(), _>(CoreError::Cancelled)?;
                    }
                    match self.boot(&cancel).await {
                        Ok(()) => {
                            if self.transition(SandboxState::Ready) {
                                yield SandboxState::Ready;
                            }
                            break;
                        }
                        Err(e) if boot_should_retry(&e) => {
                            let delay = match &e {
                                CoreError::PoolExhausted { .. } => self.config.waiting_retry(),
                                _ => backoff.next_delay().unwrap_or_else(|| self.config.waiting_retry()),
                            };
                            warn!(project_id = %self.project_id, error = %e, retry_in_ms = delay.as_millis() as u64, "Sandbox not ready, retrying");
                            if self.transition(SandboxState::BuildingWaiting) {
                                yield SandboxState::BuildingWaiting;
                            }
                            if !sleep_with_cancel(delay, &cancel).await {
                                Err::<(), _>(CoreError::Cancelled)?;
                            }
                        }
                        Err(e) => Err::<(), _>(e)?,
                    }
                }
            }
        }
    }

    /// Reuse the persisted sandbox if it is still running and reachable.
    async fn reattach(&self, project: &ProjectHandle) -> bool {
        self.live_mut().volume = project.volume.clone();
        let Some(stored) = &project.sandbox else {
            return false;
        };
        let handle = match self.provider.from_handle(&stored.id).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(project_id = %self.project_id, sandbox = %stored.id, error = %e, "Stored sandbox is gone");
                return false;
            }
        };
        if !self.provider.poll_liveness(&handle).await.unwrap_or(false) {
            return false;
        }
        let tunnels = self.provider.list_tunnels(&handle).await.unwrap_or_default();
        let reachable = match tunnels.get(&self.config.exposed_port) {
            Some(url) => self.probe.is_reachable(url).await,
            None => false,
        };
        if !reachable {
            info!(project_id = %self.project_id, sandbox = %handle.id, "Stored sandbox is unreachable, replacing it");
            if let Err(e) = self.provider.terminate(&handle).await {
                warn!(sandbox = %handle.id, error = %e, "Failed to terminate unreachable sandbox");
            }
            return false;
        }

        info!(project_id = %self.project_id, sandbox = %handle.id, "Reattached running sandbox");
        {
            let mut live = self.live_mut();
            live.handle = Some(handle);
            live.tunnels = tunnels;
        }
        self.touch().await;
        self.refresh_file_paths().await;
        true
    }

    /// One boot attempt: volume, sandbox, reachability.
    async fn boot(&self, cancel: &CancellationToken) -> CoreResult<()> {
        let _timing = TimingGuard::sandbox(format!("boot {}", self.project_id));
        let volume = self.claim_volume().await?;

        let spec = SandboxSpec {
            image: self.template.image.clone(),
            command: self.template.start_command.clone(),
            volume,
            mount_path: self.config.mount_path.clone(),
            exposed_port: Some(self.config.exposed_port),
            timeout: self.config.expiry(),
            labels: BTreeMap::from([
                ("promptstack.project".to_string(), self.project_id.clone()),
                ("promptstack.template".to_string(), self.template.id.clone()),
            ]),
        };
        let handle = self.provider.create(&spec).await?;
        info!(project_id = %self.project_id, sandbox = %handle.id, "Sandbox created");

        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(self.config.expiry_secs as i64);
        let persisted = handle.clone();
        self.projects
            .update(&self.project_id, move |p| {
                p.sandbox = Some(persisted);
                p.expires_at = Some(expires_at);
                p.last_used_at = Some(now);
            })
            .await?;
        self.live_mut().handle = Some(handle.clone());

        if let Err(e) = self.wait_reachable(&handle, cancel).await {
            self.discard(&handle).await;
            return Err(e);
        }
        self.refresh_file_paths().await;
        Ok(())
    }

    /// The project's volume, claiming a prepared one on first boot.
    async fn claim_volume(&self) -> CoreResult<VolumeRef> {
        if let Some(volume) = self.live().volume.clone() {
            return Ok(volume);
        }
        let pooled = self.pool.claim(&self.template.id).await?;
        if let Err(e) = self.provider.terminate(&pooled.handle).await {
            if !e.is_gone() {
                warn!(sandbox = %pooled.handle.id, error = %e, "Failed to terminate prepared sandbox");
            }
        }
        let volume = pooled.volume;
        let persisted = volume.clone();
        self.projects
            .update(&self.project_id, move |p| p.volume = Some(persisted))
            .await?;
        self.live_mut().volume = Some(volume.clone());
        info!(project_id = %self.project_id, volume = %volume.name, "Claimed prepared volume");
        Ok(volume)
    }

    async fn wait_reachable(&self, handle: &SandboxHandle, cancel: &CancellationToken) -> CoreResult<()> {
        let deadline = Instant::now() + self.config.boot_timeout();
        loop {
            if !self.provider.poll_liveness(handle).await? {
                return Err(SandboxError::NotRunning.into());
            }
            let tunnels = self.provider.list_tunnels(handle).await?;
            if let Some(url) = tunnels.get(&self.config.exposed_port) {
                if self.probe.is_reachable(url).await {
                    debug!(project_id = %self.project_id, url = %url, "Sandbox reachable");
                    self.live_mut().tunnels = tunnels;
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(SandboxError::Timeout(self.config.boot_timeout()).into());
            }
            if !sleep_with_cancel(self.config.liveness_poll(), cancel).await {
                return Err(CoreError::Cancelled);
            }
        }
    }

    /// Drop a sandbox that failed to come up.
    async fn discard(&self, handle: &SandboxHandle) {
        if let Err(e) = self.provider.terminate(handle).await {
            warn!(sandbox = %handle.id, error = %e, "Failed to terminate failed sandbox");
        }
        {
            let mut live = self.live_mut();
            live.handle = None;
            live.tunnels.clear();
        }
        if let Err(e) = self.clear_persisted_sandbox().await {
            warn!(project_id = %self.project_id, error = %e, "Failed to clear sandbox handle");
        }
    }

    async fn clear_persisted_sandbox(&self) -> CoreResult<()> {
        self.projects
            .update(&self.project_id, |p| {
                p.sandbox = None;
                p.expires_at = None;
            })
            .await?;
        Ok(())
    }

    /// Whether the sandbox is still running. Transient provider errors count
    /// as alive so a flaky backend does not trigger reboots.
    pub async fn check_alive(&self) -> bool {
        let Some(handle) = self.handle() else {
            return false;
        };
        match self.provider.poll_liveness(&handle).await {
            Ok(alive) => alive,
            Err(e) if e.is_gone() => false,
            Err(e) => {
                warn!(project_id = %self.project_id, error = %e, "Liveness poll failed");
                true
            }
        }
    }

    /// Stop the sandbox and go `Offline`. The volume is kept.
    pub async fn terminate(&self) -> CoreResult<()> {
        let handle = self.live_mut().handle.take();
        if let Some(handle) = handle {
            info!(project_id = %self.project_id, sandbox = %handle.id, "Terminating sandbox");
            self.provider.terminate(&handle).await?;
            self.clear_persisted_sandbox().await?;
        }
        self.mark_offline();
        Ok(())
    }

    async fn touch(&self) {
        if let Err(e) = self.projects.touch(&self.project_id).await {
            warn!(project_id = %self.project_id, error = %e, "Failed to record project use");
        }
    }

    /// Run a command in the live sandbox.
    pub async fn execute(&self, command: &str, workdir: Option<&str>) -> CoreResult<SandboxOutput> {
        let handle = self.handle().ok_or(SandboxError::NotRunning)?;
        self.touch().await;
        let output = self
            .provider
            .execute(&handle, command, workdir, self.config.command_timeout())
            .await?;
        Ok(output)
    }

    /// Run a command for the agent. Failures come back as text.
    pub async fn run_command(&self, command: &str, workdir: Option<&str>) -> String {
        if self.handle().is_none() {
            return BOOTING_MESSAGE.to_string();
        }
        match self.execute(command, workdir).await {
            Ok(output) => output.combined(),
            Err(e) => {
                warn!(project_id = %self.project_id, command, error = %e, "Command failed");
                format!("Error: {e}")
            }
        }
    }

    /// Re-read the tracked file list.
    pub async fn refresh_file_paths(&self) {
        let command = format!("cd {} && git ls-files", shell_escape(&self.config.mount_path));
        match self.execute(&command, None).await {
            Ok(output) if output.is_success() => {
                let paths = self.tracked_paths(&output.stdout);
                self.live_mut().file_paths = paths;
            }
            Ok(output) => debug!(project_id = %self.project_id, exit_code = output.exit_code, "git ls-files failed"),
            Err(e) => debug!(project_id = %self.project_id, error = %e, "Could not list files"),
        }
    }

    fn tracked_paths(&self, listing: &str) -> Vec<String> {
        listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| self.resolve(line))
            .collect()
    }

    /// Absolute path inside the sandbox.
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.config.mount_path.trim_end_matches('/'), path)
        }
    }

    /// Path relative to the volume root, if `path` lies on the volume.
    fn volume_path(&self, path: &str) -> Option<String> {
        let absolute = self.resolve(path);
        let mount = format!("{}/", self.config.mount_path.trim_end_matches('/'));
        absolute.strip_prefix(&mount).map(str::to_string)
    }

    fn commit_script(&self, files: &[(String, String)], message: &str, inline: bool) -> String {
        let mut script = String::from("set -e\n");
        if inline {
            for (path, content) in files {
                let path = shell_escape(&self.resolve(path));
                script.push_str(&format!(
                    "mkdir -p \"$(dirname {path})\" && echo {} | base64 -d > {path}\n",
                    shell_escape(&BASE64.encode(content))
                ));
            }
        }
        script.push_str(&format!(
            "cd {}\ngit add -A\ngit diff --cached --quiet || git commit -q -m {}\n",
            shell_escape(&self.config.mount_path),
            shell_escape(message)
        ));
        script.push_str(&format!(
            "echo {HISTORY_MARKER}\ngit log --oneline -n 10\necho {FILES_MARKER}\ngit ls-files\n"
        ));
        script
    }

    fn record_commit_output(&self, stdout: &str) {
        let (_, rest) = stdout.split_once(HISTORY_MARKER).unwrap_or(("", stdout));
        let (history, files) = rest.split_once(FILES_MARKER).unwrap_or((rest, ""));
        let history: Vec<String> = history
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let paths = self.tracked_paths(files);
        let mut live = self.live_mut();
        live.history = history;
        live.file_paths = paths;
    }

    pub async fn write_files_and_commit(
        &self,
        files: &[(String, String)],
        message: &str,
    ) -> CoreResult<Vec<String>> {
        let _timing = TimingGuard::sandbox(format!("commit {} files", files.len()));
        let encoded: usize = files.iter().map(|(_, c)| c.len() * 4 / 3 + 64).sum();
        let inline = encoded < INLINE_SCRIPT_LIMIT;
        if !inline {
            self.write_through_volume(files).await?;
        }

        let script = self.commit_script(files, message, inline);
        let output = self.execute(&script, None).await?;
        if !output.is_success() {
            return Err(SandboxError::ExecFailed(output.combined()).into());
        }
        self.record_commit_output(&output.stdout);

        let written: Vec<String> = files.iter().map(|(p, _)| self.resolve(p)).collect();
        info!(project_id = %self.project_id, files = written.len(), "Committed changes");
        Ok(written)
    }

    async fn write_through_volume(&self, files: &[(String, String)]) -> CoreResult<()> {
        let volume = self
            .live()
            .volume
            .clone()
            .ok_or_else(|| SandboxError::Volume("project has no volume".into()))?;
        for (path, content) in files {
            let relative = self
                .volume_path(path)
                .ok_or_else(|| SandboxError::write_failed(path.as_str(), "outside the project volume"))?;
            self.provider
                .write_volume_file(&volume, &relative, content.as_bytes())
                .await?;
        }
        Ok(())
    }

    /// Read a file, from the live sandbox or straight from the volume.
    pub async fn read_file(&self, path: &str) -> CoreResult<Vec<u8>> {
        let absolute = self.resolve(path);
        if self.handle().is_some() {
            let quoted = shell_escape(&absolute);
            let command = format!("if [ -f {quoted} ]; then base64 {quoted}; else exit {MISSING_FILE_EXIT}; fi");
            let output = self.execute(&command, None).await?;
            if output.exit_code == MISSING_FILE_EXIT {
                return Err(SandboxError::FileNotFound(absolute).into());
            }
            if !output.is_success() {
                return Err(SandboxError::read_failed(absolute, output.combined()).into());
            }
            let compact: String = output.stdout.split_whitespace().collect();
            return BASE64
                .decode(compact)
                .map_err(|e| SandboxError::read_failed(path, e.to_string()).into());
        }

        let volume = self.live().volume.clone();
        let volume = match volume {
            Some(volume) => volume,
            None => self
                .projects
                .get(&self.project_id)
                .await?
                .volume
                .ok_or_else(|| SandboxError::FileNotFound(absolute.clone()))?,
        };
        let relative = self
            .volume_path(path)
            .ok_or_else(|| SandboxError::FileNotFound(absolute.clone()))?;
        Ok(self.provider.read_volume_file(&volume, &relative).await?)
    }
}

fn boot_should_retry(error: &CoreError) -> bool {
    match error {
        CoreError::Sandbox(e) => e.is_transient() || e.is_gone(),
        other => other.is_retryable(),
    }
}

#[async_trait]
impl ProjectWorkspace for SandboxLifecycle {
    async fn read_file(&self, path: &str) -> CoreResult<Vec<u8>> {
        SandboxLifecycle::read_file(self, path).await
    }

    async fn write_files_and_commit(
        &self,
        files: &[(String, String)],
        message: &str,
    ) -> CoreResult<Vec<String>> {
        SandboxLifecycle::write_files_and_commit(self, files, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::probe::MockProbe;
    use crate::stacks::{builtin_stacks, StackCatalog};
    use futures::StreamExt;
    use promptstack_storage::MemoryStorage;
    use promptstack_test_utils::MockResourceProvider;

    struct Fixture {
        provider: Arc<MockResourceProvider>,
        pool: Arc<PreparedPool>,
        projects: ProjectStore,
    }

    fn fixture(pool_size: usize) -> Fixture {
        let provider = Arc::new(MockResourceProvider::new());
        let storage = Arc::new(MemoryStorage::new());
        let pool = Arc::new(PreparedPool::new(
            provider.clone(),
            storage.clone(),
            StackCatalog::new(builtin_stacks()),
            PoolConfig {
                target_size: pool_size,
                provision_timeout_secs: 60,
            },
            SandboxConfig::default(),
        ));
        Fixture {
            provider,
            pool,
            projects: ProjectStore::new(storage),
        }
    }

    fn reachable_probe() -> Arc<dyn Probe> {
        let mut probe = MockProbe::new();
        probe.expect_is_reachable().returning(|_| true);
        Arc::new(probe)
    }

    async fn lifecycle(fx: &Fixture, probe: Arc<dyn Probe>) -> Arc<SandboxLifecycle> {
        let project = fx.projects.create("demo", "nextjs").await.unwrap();
        Arc::new(SandboxLifecycle::new(
            project.project_id,
            builtin_stacks().remove(0),
            SandboxConfig::default(),
            fx.provider.clone(),
            fx.pool.clone(),
            fx.projects.clone(),
            probe,
        ))
    }

    async fn collect(lc: Arc<SandboxLifecycle>) -> Vec<SandboxState> {
        lc.ensure_ready(CancellationToken::new())
            .map(|s| s.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_fresh_boot_claims_volume_and_reaches_ready() {
        let fx = fixture(1);
        fx.pool.top_up().await;
        let lc = lifecycle(&fx, reachable_probe()).await;

        let states = collect(lc.clone()).await;
        assert_eq!(states, vec![SandboxState::Building, SandboxState::Ready]);
        assert_eq!(lc.state(), SandboxState::Ready);
        assert!(lc.app_url().is_some());

        let project = fx.projects.get(lc.project_id()).await.unwrap();
        assert!(project.sandbox.is_some());
        assert!(project.volume.is_some());
        assert!(project.expires_at.is_some());
        assert_eq!(fx.pool.available("nextjs"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pool_waits_instead_of_failing() {
        let fx = fixture(1);
        let lc = lifecycle(&fx, reachable_probe()).await;

        let mut stream = Box::pin(lc.clone().ensure_ready(CancellationToken::new()));
        assert_eq!(stream.next().await.unwrap().unwrap(), SandboxState::Building);
        assert_eq!(stream.next().await.unwrap().unwrap(), SandboxState::BuildingWaiting);

        fx.pool.top_up().await;
        assert_eq!(stream.next().await.unwrap().unwrap(), SandboxState::Ready);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_create_failure_is_retried() {
        let fx = fixture(1);
        fx.pool.top_up().await;
        fx.provider.fail_next_creates(1);
        let lc = lifecycle(&fx, reachable_probe()).await;

        let states = collect(lc).await;
        assert_eq!(
            states,
            vec![SandboxState::Building, SandboxState::BuildingWaiting, SandboxState::Ready]
        );
    }

    #[tokio::test]
    async fn test_reattaches_live_sandbox() {
        let fx = fixture(1);
        fx.pool.top_up().await;
        let first = lifecycle(&fx, reachable_probe()).await;
        collect(first.clone()).await;
        let creates = fx.provider.created().len();

        let second = Arc::new(SandboxLifecycle::new(
            first.project_id(),
            builtin_stacks().remove(0),
            SandboxConfig::default(),
            fx.provider.clone(),
            fx.pool.clone(),
            fx.projects.clone(),
            reachable_probe(),
        ));
        assert_eq!(collect(second.clone()).await, vec![SandboxState::Ready]);
        assert_eq!(fx.provider.created().len(), creates);
        assert_eq!(second.handle(), first.handle());
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let fx = fixture(0);
        let lc = lifecycle(&fx, reachable_probe()).await;
        let cancel = CancellationToken::new();
        let mut stream = Box::pin(lc.ensure_ready(cancel.clone()));
        assert_eq!(stream.next().await.unwrap().unwrap(), SandboxState::Building);
        assert_eq!(stream.next().await.unwrap().unwrap(), SandboxState::BuildingWaiting);
        cancel.cancel();
        assert!(matches!(stream.next().await, Some(Err(CoreError::Cancelled))));
    }

    #[tokio::test]
    async fn test_illegal_transitions_are_refused() {
        let fx = fixture(0);
        let lc = lifecycle(&fx, reachable_probe()).await;
        assert!(!lc.transition(SandboxState::Working));
        assert!(lc.transition(SandboxState::Building));
        assert!(!lc.transition(SandboxState::Working));
        assert!(lc.transition(SandboxState::Ready));
        assert!(!lc.transition(SandboxState::Building));
        assert!(lc.transition(SandboxState::Working));
        assert!(lc.force_ready());
        assert!(!lc.force_ready());
    }

    #[tokio::test]
    async fn test_run_command_before_boot() {
        let fx = fixture(0);
        let lc = lifecycle(&fx, reachable_probe()).await;
        assert_eq!(lc.run_command("ls", None).await, BOOTING_MESSAGE);
    }

    #[tokio::test]
    async fn test_run_command_reports_errors_as_text() {
        let fx = fixture(1);
        fx.pool.top_up().await;
        let lc = lifecycle(&fx, reachable_probe()).await;
        collect(lc.clone()).await;

        fx.provider.set_exec_handler(|cmd| {
            if cmd == "false" {
                SandboxOutput::failure(1, "boom")
            } else {
                SandboxOutput::success("ok")
            }
        });
        assert_eq!(lc.run_command("echo ok", None).await, "ok");
        assert_eq!(lc.run_command("false", None).await, "boom");
        fx.provider.fail_exec(true);
        assert!(lc.run_command("echo ok", None).await.starts_with("Error:"));
    }

    #[tokio::test]
    async fn test_write_files_and_commit_is_one_script() {
        let fx = fixture(1);
        fx.pool.top_up().await;
        let lc = lifecycle(&fx, reachable_probe()).await;
        collect(lc.clone()).await;

        fx.provider.set_exec_handler(|cmd| {
            if cmd.contains(HISTORY_MARKER) {
                SandboxOutput::success(format!(
                    "{HISTORY_MARKER}\nabc123 Add page\n{FILES_MARKER}\nfrontend/page.js\nREADME.md\n"
                ))
            } else {
                SandboxOutput::success("")
            }
        });
        let before = fx.provider.commands().len();
        let written = lc
            .write_files_and_commit(
                &[("frontend/page.js".into(), "export default 1".into())],
                "Add page",
            )
            .await
            .unwrap();

        assert_eq!(written, vec!["/app/frontend/page.js"]);
        let commands = fx.provider.commands();
        assert_eq!(commands.len(), before + 1);
        let script = commands.last().unwrap();
        assert!(script.contains(&BASE64.encode("export default 1")));
        assert!(script.contains("git commit -q -m 'Add page'"));
        assert_eq!(lc.history(), vec!["abc123 Add page"]);
        assert_eq!(lc.file_paths(), vec!["/app/frontend/page.js", "/app/README.md"]);
    }

    #[tokio::test]
    async fn test_read_file_missing_and_from_volume() {
        let fx = fixture(1);
        fx.pool.top_up().await;
        let lc = lifecycle(&fx, reachable_probe()).await;
        collect(lc.clone()).await;

        fx.provider
            .set_exec_handler(|_| SandboxOutput::failure(MISSING_FILE_EXIT, ""));
        assert!(matches!(
            lc.read_file("/app/nope.js").await,
            Err(CoreError::Sandbox(SandboxError::FileNotFound(_)))
        ));

        fx.provider.set_exec_handler(|_| SandboxOutput::success(BASE64.encode("hello")));
        assert_eq!(lc.read_file("a.txt").await.unwrap(), b"hello");

        lc.terminate().await.unwrap();
        assert_eq!(lc.state(), SandboxState::Offline);
        let volume = fx.projects.get(lc.project_id()).await.unwrap().volume.unwrap();
        fx.provider.put_volume_file(&volume, "notes.md", b"from volume");
        assert_eq!(lc.read_file("/app/notes.md").await.unwrap(), b"from volume");
    }

    #[tokio::test]
    async fn test_terminate_keeps_volume() {
        let fx = fixture(1);
        fx.pool.top_up().await;
        let lc = lifecycle(&fx, reachable_probe()).await;
        collect(lc.clone()).await;
        lc.terminate().await.unwrap();

        let project = fx.projects.get(lc.project_id()).await.unwrap();
        assert!(project.sandbox.is_none());
        assert!(project.expires_at.is_none());
        assert!(project.volume.is_some());
        assert!(!lc.check_alive().await);
    }
}
