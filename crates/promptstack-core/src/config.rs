//! Engine configuration.
//!
//! Loaded in layers, later ones winning:
//! 1. Built-in defaults
//! 2. `promptstack.json` in the data directory, or the file given with `--config`
//! 3. `PROMPTSTACK_CONFIG_CONTENT` (inline JSON, merged key by key)
//! 4. Individual `PROMPTSTACK_*` environment overrides and vendor API keys

use crate::error::{ConfigError, CoreResult};
use promptstack_sandbox::DockerConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "promptstack.json";
pub const CONFIG_CONTENT_ENV: &str = "PROMPTSTACK_CONFIG_CONTENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub sandbox: SandboxConfig,
    pub orchestrator: OrchestratorConfig,
    pub maintenance: MaintenanceConfig,
    pub diff: DiffConfig,
    pub model: ModelConfig,
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Warm sandboxes kept per template.
    pub target_size: usize,
    /// Upper bound for create + init of one pooled sandbox.
    pub provision_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 1,
            provision_timeout_secs: 600,
        }
    }
}

impl PoolConfig {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// How long a booting sandbox may take to become reachable.
    pub boot_timeout_secs: u64,
    /// Lifetime of a sandbox process before the provider kills it.
    pub expiry_secs: u64,
    pub exposed_port: u16,
    pub mount_path: String,
    /// Retry interval while waiting for a prepared sandbox.
    pub waiting_retry_secs: u64,
    pub liveness_poll_ms: u64,
    pub command_timeout_secs: u64,
    /// Attempts for transient provider failures during boot.
    pub boot_attempts: u32,
    /// How often a ready sandbox is checked for liveness.
    pub supervise_interval_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            boot_timeout_secs: 600,
            expiry_secs: 3600,
            exposed_port: 3000,
            mount_path: "/app".to_string(),
            waiting_retry_secs: 30,
            liveness_poll_ms: 2000,
            command_timeout_secs: 120,
            boot_attempts: 5,
            supervise_interval_secs: 30,
        }
    }
}

impl SandboxConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    pub fn waiting_retry(&self) -> Duration {
        Duration::from_secs(self.waiting_retry_secs)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// A project with no viewers for this long is reaped.
    pub idle_timeout_secs: u64,
    /// Sandboxes unused for this long are terminated (volumes are kept).
    pub stale_resource_timeout_secs: u64,
    /// A viewer that cannot take an event within this long is dropped.
    pub viewer_send_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            stale_resource_timeout_secs: 15 * 60,
            viewer_send_timeout_ms: 5000,
        }
    }
}

impl OrchestratorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stale_resource_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_resource_timeout_secs)
    }

    pub fn viewer_send_timeout(&self) -> Duration {
        Duration::from_millis(self.viewer_send_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// A content pattern and the adjustment it triggers in the merge prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipRule {
    pub pattern: String,
    pub tip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Phrases marking elided code. Their presence forces an LLM merge.
    pub elision_markers: Vec<String>,
    /// Added to the built-in adjustment tips.
    pub extra_tips: Vec<TipRule>,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            elision_markers: vec!["existing code".to_string()],
            extra_tips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// `openai` or `anthropic`.
    pub provider: String,
    pub main_model: String,
    /// Used for merges, follow-ups and naming.
    pub fast_model: String,
    pub max_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            main_model: "gpt-4o".to_string(),
            fast_model: "gpt-4o-mini".to_string(),
            max_steps: 25,
            max_tokens: None,
            api_key: None,
            base_url: None,
        }
    }
}

impl EngineConfig {
    /// Load from every source. Returns the config and the files that were read.
    pub async fn load(explicit: Option<&Path>) -> CoreResult<(Self, Vec<PathBuf>)> {
        let mut sources = Vec::new();
        let mut value = serde_json::to_value(EngineConfig::default())?;

        let file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::data_dir()
                .map(|d| d.join(CONFIG_FILE_NAME))
                .filter(|p| p.exists()),
        };
        if let Some(path) = file {
            let content = tokio::fs::read_to_string(&path).await?;
            merge_json(&mut value, parse_json(&content, &path.display().to_string())?);
            sources.push(path);
        }

        if let Ok(content) = std::env::var(CONFIG_CONTENT_ENV) {
            merge_json(&mut value, parse_json(&content, "<env>")?);
        }

        let mut config = Self::from_value(value, "<merged>")?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok((config, sources))
    }

    /// Parse one JSON document on top of the defaults.
    pub fn parse(content: &str, source: &str) -> CoreResult<Self> {
        let mut value = serde_json::to_value(EngineConfig::default())?;
        merge_json(&mut value, parse_json(content, source)?);
        Self::from_value(value, source)
    }

    fn from_value(value: Value, source: &str) -> CoreResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            ConfigError::InvalidJson {
                path: source.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PROMPTSTACK_POOL_TARGET_SIZE") {
            self.pool.target_size = parse_number("PROMPTSTACK_POOL_TARGET_SIZE", &v)?;
        }
        if let Some(v) = lookup("PROMPTSTACK_IDLE_TIMEOUT_SECS") {
            self.orchestrator.idle_timeout_secs = parse_number("PROMPTSTACK_IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PROMPTSTACK_BOOT_TIMEOUT_SECS") {
            self.sandbox.boot_timeout_secs = parse_number("PROMPTSTACK_BOOT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PROMPTSTACK_MAINTENANCE_INTERVAL_SECS") {
            self.maintenance.interval_secs =
                parse_number("PROMPTSTACK_MAINTENANCE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("PROMPTSTACK_RUN_PERIODIC_CLEANUP") {
            self.maintenance.enabled = parse_bool(&v);
        }
        if let Some(v) = lookup("PROMPTSTACK_PROVIDER") {
            match v.as_str() {
                "openai" | "anthropic" => self.model.provider = v,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "PROMPTSTACK_PROVIDER".to_string(),
                        value: v,
                    }
                    .into())
                }
            }
        }
        if let Some(v) = lookup("PROMPTSTACK_MAIN_MODEL") {
            self.model.main_model = v;
        }
        if let Some(v) = lookup("PROMPTSTACK_FAST_MODEL") {
            self.model.fast_model = v;
        }
        if self.model.api_key.is_none() {
            let key_var = match self.model.provider.as_str() {
                "anthropic" => "ANTHROPIC_API_KEY",
                _ => "OPENAI_API_KEY",
            };
            self.model.api_key = lookup(key_var).filter(|k| !k.is_empty());
        }
        Ok(())
    }

    /// `<data_local_dir>/promptstack`.
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("promptstack"))
    }
}

fn parse_json(content: &str, source: &str) -> CoreResult<Value> {
    serde_json::from_str(content).map_err(|e| {
        ConfigError::InvalidJson {
            path: source.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> CoreResult<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }
        .into()
    })
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1")
}

/// Deep-merge `overlay` into `base`. Objects merge per key; anything else replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
