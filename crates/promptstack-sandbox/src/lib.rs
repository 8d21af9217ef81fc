//! Sandbox compute provider for promptstack.
//!
//! A sandbox is an isolated, network-reachable environment that runs one
//! project's dev server over a persistent volume. This crate defines the
//! [`ResourceProvider`] seam the engine drives, plus a Docker implementation:
//!
//! - **Docker**: one container per sandbox, one named volume per project
//!
//! Stack templates ([`StackTemplate`]) describe what a sandbox boots from.

pub mod config;
pub mod error;
pub mod runtime;
pub mod template;

pub use config::{DockerConfig, ResourceLimits};
pub use error::{SandboxError, SandboxResult};
pub use runtime::DockerProvider;
pub use template::StackTemplate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Opaque reference to a running (or once-running) sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Persistent storage mounted into a sandbox. Outlives any one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeRef {
    pub name: String,
}

impl VolumeRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// What to boot.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    /// Shell command run as the sandbox's main process.
    pub command: String,
    pub volume: VolumeRef,
    /// Where `volume` is mounted inside the sandbox.
    pub mount_path: String,
    pub exposed_port: Option<u16>,
    /// Hard lifetime; the sandbox stops itself after this.
    pub timeout: Duration,
    pub labels: BTreeMap<String, String>,
}

/// Result of a command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl SandboxOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, as an agent would see them in a terminal.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Creates, inspects and tears down sandboxes and their volumes.
///
/// Implementations must be safe to share across projects; every call names
/// the handle or volume it acts on.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Boot a sandbox. Returns once the main process has started, not once
    /// it is reachable.
    async fn create(&self, spec: &SandboxSpec) -> SandboxResult<SandboxHandle>;

    /// Re-attach to a sandbox by id. [`SandboxError::NotFound`] if it is gone.
    async fn from_handle(&self, id: &str) -> SandboxResult<SandboxHandle>;

    /// Stop and remove a sandbox. Terminating a missing sandbox succeeds.
    async fn terminate(&self, handle: &SandboxHandle) -> SandboxResult<()>;

    /// Run `command` through `sh -c`. A non-zero exit is returned as output,
    /// not as an error.
    async fn execute(
        &self,
        handle: &SandboxHandle,
        command: &str,
        workdir: Option<&str>,
        timeout: Duration,
    ) -> SandboxResult<SandboxOutput>;

    /// Exposed port to publicly reachable URL.
    async fn list_tunnels(&self, handle: &SandboxHandle) -> SandboxResult<BTreeMap<u16, String>>;

    /// Whether the sandbox's main process is still running.
    async fn poll_liveness(&self, handle: &SandboxHandle) -> SandboxResult<bool>;

    async fn create_volume(&self, label: &str) -> SandboxResult<VolumeRef>;

    async fn delete_volume(&self, volume: &VolumeRef) -> SandboxResult<()>;

    /// Read a file by path relative to the volume root.
    async fn read_volume_file(&self, volume: &VolumeRef, path: &str) -> SandboxResult<Vec<u8>>;

    async fn write_volume_file(
        &self,
        volume: &VolumeRef,
        path: &str,
        content: &[u8],
    ) -> SandboxResult<()>;
}

/// Quote a string for `sh`.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
