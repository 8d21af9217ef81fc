//! In-memory sandbox provider.

use async_trait::async_trait;
use promptstack_sandbox::{
    ResourceProvider, SandboxError, SandboxHandle, SandboxOutput, SandboxResult, SandboxSpec,
    VolumeRef,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type ExecHandler = dyn Fn(&str) -> SandboxOutput + Send + Sync;

#[derive(Debug, Clone)]
struct MockSandboxEntry {
    spec: SandboxSpec,
    alive: bool,
}

#[derive(Default)]
struct MockState {
    next_id: usize,
    sandboxes: HashMap<String, MockSandboxEntry>,
    created: Vec<SandboxSpec>,
    terminated: Vec<String>,
    volumes: HashMap<String, HashMap<String, Vec<u8>>>,
    commands: Vec<String>,
    fail_creates: usize,
    fail_exec: bool,
}

/// A [`ResourceProvider`] that keeps everything in memory.
///
/// Sandboxes created without an exposed port behave like init jobs: they
/// report as exited straight away. Sandboxes with a port stay alive until
/// terminated or [`kill`](Self::kill)ed and expose one tunnel,
/// `http://<id>.sandbox.localhost:<port>`. Commands succeed with empty
/// output unless an exec handler is set.
///
/// # Example
///
/// ```rust,ignore
/// let provider = MockResourceProvider::new();
/// provider.set_exec_handler(|cmd| SandboxOutput::success(format!("ran {cmd}")));
/// provider.fail_next_creates(1);
/// ```
#[derive(Default)]
pub struct MockResourceProvider {
    state: Mutex<MockState>,
    exec_handler: Mutex<Option<Arc<ExecHandler>>>,
}

impl MockResourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` calls to `create` fail with a transient error.
    pub fn fail_next_creates(&self, count: usize) {
        self.state().fail_creates = count;
    }

    /// Make every `execute` fail until switched off again.
    pub fn fail_exec(&self, fail: bool) {
        self.state().fail_exec = fail;
    }

    /// Answer commands with `handler` instead of empty output.
    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&str) -> SandboxOutput + Send + Sync + 'static,
    {
        let handler: Arc<ExecHandler> = Arc::new(handler);
        *self.exec_handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    /// Stop a sandbox's main process without removing it.
    pub fn kill(&self, id: &str) {
        if let Some(entry) = self.state().sandboxes.get_mut(id) {
            entry.alive = false;
        }
    }

    /// Specs of every successful `create`, in order.
    pub fn created(&self) -> Vec<SandboxSpec> {
        self.state().created.clone()
    }

    /// Ids passed to `terminate`, in order.
    pub fn terminated(&self) -> Vec<String> {
        self.state().terminated.clone()
    }

    /// Every command executed, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Ids of sandboxes whose main process is running.
    pub fn live_sandboxes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state()
            .sandboxes
            .iter()
            .filter(|(_, e)| e.alive)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn volume_count(&self) -> usize {
        self.state().volumes.len()
    }

    pub fn put_volume_file(&self, volume: &VolumeRef, path: &str, content: &[u8]) {
        self.state()
            .volumes
            .entry(volume.name.clone())
            .or_default()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn volume_file(&self, volume: &VolumeRef, path: &str) -> Option<Vec<u8>> {
        self.state().volumes.get(&volume.name)?.get(path).cloned()
    }
}

#[async_trait]
impl ResourceProvider for MockResourceProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, spec: &SandboxSpec) -> SandboxResult<SandboxHandle> {
        let mut state = self.state();
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(SandboxError::unavailable("scripted create failure"));
        }
        if !state.volumes.contains_key(&spec.volume.name) {
            return Err(SandboxError::Volume(format!("no such volume: {}", spec.volume.name)));
        }
        state.next_id += 1;
        let id = format!("sbx_mock_{}", state.next_id);
        state.sandboxes.insert(
            id.clone(),
            MockSandboxEntry {
                spec: spec.clone(),
                alive: spec.exposed_port.is_some(),
            },
        );
        state.created.push(spec.clone());
        Ok(SandboxHandle::new(id))
    }

    async fn from_handle(&self, id: &str) -> SandboxResult<SandboxHandle> {
        if self.state().sandboxes.contains_key(id) {
            Ok(SandboxHandle::new(id))
        } else {
            Err(SandboxError::NotFound(id.to_string()))
        }
    }

    async fn terminate(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let mut state = self.state();
        state.terminated.push(handle.id.clone());
        state.sandboxes.remove(&handle.id);
        Ok(())
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        command: &str,
        _workdir: Option<&str>,
        _timeout: Duration,
    ) -> SandboxResult<SandboxOutput> {
        {
            let mut state = self.state();
            match state.sandboxes.get(&handle.id) {
                None => return Err(SandboxError::NotFound(handle.id.clone())),
                Some(entry) if !entry.alive => return Err(SandboxError::NotRunning),
                Some(_) => {}
            }
            state.commands.push(command.to_string());
            if state.fail_exec {
                return Err(SandboxError::ExecFailed("scripted exec failure".to_string()));
            }
        }
        let handler = self.exec_handler.lock().unwrap_or_else(|p| p.into_inner()).clone();
        Ok(match handler {
            Some(handler) => handler(command),
            None => SandboxOutput::success(""),
        })
    }

    async fn list_tunnels(&self, handle: &SandboxHandle) -> SandboxResult<BTreeMap<u16, String>> {
        let state = self.state();
        let entry = state
            .sandboxes
            .get(&handle.id)
            .ok_or_else(|| SandboxError::NotFound(handle.id.clone()))?;
        Ok(entry
            .spec
            .exposed_port
            .map(|port| (port, format!("http://{}.sandbox.localhost:{port}", handle.id)))
            .into_iter()
            .collect())
    }

    async fn poll_liveness(&self, handle: &SandboxHandle) -> SandboxResult<bool> {
        self.state()
            .sandboxes
            .get(&handle.id)
            .map(|e| e.alive)
            .ok_or_else(|| SandboxError::NotFound(handle.id.clone()))
    }

    async fn create_volume(&self, label: &str) -> SandboxResult<VolumeRef> {
        self.state().volumes.entry(label.to_string()).or_default();
        Ok(VolumeRef::new(label))
    }

    async fn delete_volume(&self, volume: &VolumeRef) -> SandboxResult<()> {
        self.state().volumes.remove(&volume.name);
        Ok(())
    }

    async fn read_volume_file(&self, volume: &VolumeRef, path: &str) -> SandboxResult<Vec<u8>> {
        let state = self.state();
        let files = state
            .volumes
            .get(&volume.name)
            .ok_or_else(|| SandboxError::Volume(format!("no such volume: {}", volume.name)))?;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::FileNotFound(path.to_string()))
    }

    async fn write_volume_file(&self, volume: &VolumeRef, path: &str, content: &[u8]) -> SandboxResult<()> {
        let mut state = self.state();
        let files = state
            .volumes
            .get_mut(&volume.name)
            .ok_or_else(|| SandboxError::Volume(format!("no such volume: {}", volume.name)))?;
        files.insert(path.to_string(), content.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(volume: &VolumeRef, port: Option<u16>) -> SandboxSpec {
        SandboxSpec {
            image: "node:20".into(),
            command: "npm run dev".into(),
            volume: volume.clone(),
            mount_path: "/app".into(),
            exposed_port: port,
            timeout: Duration::from_secs(60),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_init_sandbox_exits_and_server_stays_up() {
        let provider = MockResourceProvider::new();
        let volume = provider.create_volume("vol_1").await.unwrap();

        let init = provider.create(&spec(&volume, None)).await.unwrap();
        assert!(!provider.poll_liveness(&init).await.unwrap());

        let server = provider.create(&spec(&volume, Some(3000))).await.unwrap();
        assert!(provider.poll_liveness(&server).await.unwrap());
        let tunnels = provider.list_tunnels(&server).await.unwrap();
        assert!(tunnels[&3000].ends_with(":3000"));

        provider.kill(&server.id);
        assert!(!provider.poll_liveness(&server).await.unwrap());
        assert!(matches!(
            provider.execute(&server, "ls", None, Duration::from_secs(1)).await,
            Err(SandboxError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_create_requires_volume() {
        let provider = MockResourceProvider::new();
        let result = provider.create(&spec(&VolumeRef::new("missing"), None)).await;
        assert!(matches!(result, Err(SandboxError::Volume(_))));
    }

    #[tokio::test]
    async fn test_terminated_sandbox_is_gone() {
        let provider = MockResourceProvider::new();
        let volume = provider.create_volume("vol_1").await.unwrap();
        let handle = provider.create(&spec(&volume, Some(3000))).await.unwrap();
        provider.terminate(&handle).await.unwrap();
        assert!(provider.from_handle(&handle.id).await.unwrap_err().is_gone());
        assert_eq!(provider.terminated(), vec![handle.id]);
    }

    #[tokio::test]
    async fn test_exec_handler_and_failures() {
        let provider = MockResourceProvider::new();
        let volume = provider.create_volume("vol_1").await.unwrap();
        let handle = provider.create(&spec(&volume, Some(3000))).await.unwrap();
        provider.set_exec_handler(|cmd| SandboxOutput::success(cmd.to_uppercase()));

        let out = provider.execute(&handle, "ls", None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(out.stdout, "LS");
        provider.fail_exec(true);
        assert!(provider.execute(&handle, "ls", None, Duration::from_secs(1)).await.is_err());
        assert_eq!(provider.commands(), vec!["ls", "ls"]);
    }

    #[tokio::test]
    async fn test_volume_files() {
        let provider = MockResourceProvider::new();
        let volume = provider.create_volume("vol_1").await.unwrap();
        provider.write_volume_file(&volume, "a.txt", b"hi").await.unwrap();
        assert_eq!(provider.read_volume_file(&volume, "a.txt").await.unwrap(), b"hi");
        assert!(matches!(
            provider.read_volume_file(&volume, "b.txt").await,
            Err(SandboxError::FileNotFound(_))
        ));
        provider.delete_volume(&volume).await.unwrap();
        assert_eq!(provider.volume_count(), 0);
    }
}
