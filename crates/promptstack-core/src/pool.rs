//! Warm pool of pre-initialized sandboxes.
//!
//! Each template keeps `target_size` volumes on which the template's init
//! command has already run. Claiming one hands its volume to a project so
//! the project only pays for starting the dev server, not for initializing
//! the workspace.

use crate::config::{PoolConfig, SandboxConfig};
use crate::error::{CoreError, CoreResult};
use crate::stacks::StackCatalog;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use promptstack_sandbox::{
    ResourceProvider, SandboxHandle, SandboxSpec, StackTemplate, VolumeRef,
};
use promptstack_storage::{Storage, StorageExt};
use promptstack_util::{Identifier, TimingGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A provisioned sandbox waiting to be claimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledSandbox {
    pub template_id: String,
    /// Template hash at provisioning time; a mismatch marks the entry stale.
    pub content_hash: String,
    pub handle: SandboxHandle,
    pub volume: VolumeRef,
    pub created_at: DateTime<Utc>,
}

/// How many valid entries a template has against its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDeficit {
    pub template_id: String,
    pub valid: usize,
    pub target: usize,
}

impl PoolDeficit {
    pub fn missing(&self) -> usize {
        self.target.saturating_sub(self.valid)
    }
}

pub struct PreparedPool {
    provider: Arc<dyn ResourceProvider>,
    storage: Arc<dyn Storage>,
    catalog: StackCatalog,
    config: PoolConfig,
    sandbox: SandboxConfig,
    entries: Mutex<HashMap<String, Vec<PooledSandbox>>>,
    /// Serializes top-up and eviction so concurrent callers never over-provision.
    maintenance: tokio::sync::Mutex<()>,
}

impl PreparedPool {
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        storage: Arc<dyn Storage>,
        catalog: StackCatalog,
        config: PoolConfig,
        sandbox: SandboxConfig,
    ) -> Self {
        Self {
            provider,
            storage,
            catalog,
            config,
            sandbox,
            entries: Mutex::new(HashMap::new()),
            maintenance: tokio::sync::Mutex::new(()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<PooledSandbox>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load the persisted ledger. Returns how many entries were restored.
    ///
    /// Entries of templates no longer in the catalog are loaded too, so the
    /// next `evict_stale` releases them.
    pub async fn restore(&self) -> CoreResult<usize> {
        let mut restored = Vec::new();
        for group in self.storage.list_groups(&["pool"]).await? {
            let pooled: Vec<PooledSandbox> = self.storage.read_all(&["pool", &group]).await?;
            restored.extend(pooled);
        }
        let count = restored.len();
        let mut entries = self.entries();
        for entry in restored {
            let list = entries.entry(entry.template_id.clone()).or_default();
            if !list.iter().any(|e| e.handle == entry.handle) {
                list.push(entry);
            }
        }
        info!(count, "Restored prepared sandbox ledger");
        Ok(count)
    }

    /// Remove and return one valid entry for `template_id`. Never waits;
    /// an empty pool is `PoolExhausted`.
    pub async fn claim(&self, template_id: &str) -> CoreResult<PooledSandbox> {
        let hash = self.catalog.get(template_id)?.content_hash();
        let claimed = {
            let mut entries = self.entries();
            let list = entries.entry(template_id.to_string()).or_default();
            list.iter()
                .position(|e| e.content_hash == hash)
                .map(|i| list.remove(i))
        };
        let Some(claimed) = claimed else {
            debug!(template = template_id, "Prepared pool is empty");
            return Err(CoreError::pool_exhausted(template_id));
        };
        if let Err(e) = self.forget(&claimed).await {
            warn!(template = template_id, sandbox = %claimed.handle.id, error = %e, "Failed to drop claimed entry from ledger");
        }
        info!(template = template_id, sandbox = %claimed.handle.id, volume = %claimed.volume.name, "Claimed prepared sandbox");
        Ok(claimed)
    }

    /// Number of valid entries for a template.
    pub fn available(&self, template_id: &str) -> usize {
        let Ok(template) = self.catalog.get(template_id) else {
            return 0;
        };
        let hash = template.content_hash();
        self.entries()
            .get(template_id)
            .map(|list| list.iter().filter(|e| e.content_hash == hash).count())
            .unwrap_or(0)
    }

    pub fn deficits(&self) -> Vec<PoolDeficit> {
        self.catalog
            .all()
            .iter()
            .map(|t| PoolDeficit {
                template_id: t.id.clone(),
                valid: self.available(&t.id),
                target: self.config.target_size,
            })
            .collect()
    }

    /// Provision entries until every template has `target_size` valid ones.
    /// Individual failures are logged and skipped. Returns how many were added.
    pub async fn top_up(&self) -> usize {
        let _guard = self.maintenance.lock().await;
        let mut added = 0;
        for deficit in self.deficits() {
            let missing = deficit.missing();
            if missing == 0 {
                continue;
            }
            let Ok(template) = self.catalog.get(&deficit.template_id) else {
                continue;
            };
            info!(template = %template.id, missing, "Provisioning prepared sandboxes");

            let results = join_all((0..missing).map(|_| self.provision(template))).await;
            for result in results {
                match result {
                    Ok(entry) => {
                        if let Err(e) = self.remember(&entry).await {
                            warn!(template = %template.id, error = %e, "Failed to persist prepared sandbox");
                        }
                        self.entries()
                            .entry(entry.template_id.clone())
                            .or_default()
                            .push(entry);
                        added += 1;
                    }
                    Err(e) => warn!(template = %template.id, error = %e, "Failed to provision prepared sandbox"),
                }
            }
        }
        added
    }

    /// Delete entries whose template changed or disappeared, in bookkeeping
    /// and in the provider. Returns how many were evicted.
    pub async fn evict_stale(&self) -> usize {
        let _guard = self.maintenance.lock().await;
        let current: BTreeMap<String, String> = self
            .catalog
            .all()
            .iter()
            .map(|t| (t.id.clone(), t.content_hash()))
            .collect();

        let stale: Vec<PooledSandbox> = {
            let mut entries = self.entries();
            let mut stale = Vec::new();
            for (template_id, list) in entries.iter_mut() {
                let hash = current.get(template_id);
                let (keep, drop): (Vec<_>, Vec<_>) = list
                    .drain(..)
                    .partition(|e| Some(&e.content_hash) == hash);
                *list = keep;
                stale.extend(drop);
            }
            stale
        };

        for entry in &stale {
            info!(template = %entry.template_id, sandbox = %entry.handle.id, "Evicting stale prepared sandbox");
            self.release(entry).await;
            if let Err(e) = self.forget(entry).await {
                warn!(sandbox = %entry.handle.id, error = %e, "Failed to drop stale entry from ledger");
            }
        }
        stale.len()
    }

    async fn provision(&self, template: &StackTemplate) -> CoreResult<PooledSandbox> {
        let _timing = TimingGuard::sandbox(format!("provision {}", template.id));
        let volume = self.provider.create_volume(&Identifier::volume()).await?;

        let spec = SandboxSpec {
            image: template.image.clone(),
            command: template.init_command.clone(),
            volume: volume.clone(),
            mount_path: self.sandbox.mount_path.clone(),
            exposed_port: None,
            timeout: self.config.provision_timeout(),
            labels: BTreeMap::from([
                ("promptstack.template".to_string(), template.id.clone()),
                ("promptstack.pool".to_string(), "true".to_string()),
            ]),
        };
        let handle = match self.provider.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(cleanup) = self.provider.delete_volume(&volume).await {
                    warn!(volume = %volume.name, error = %cleanup, "Failed to delete volume after create failure");
                }
                return Err(e.into());
            }
        };

        let entry = PooledSandbox {
            template_id: template.id.clone(),
            content_hash: template.content_hash(),
            handle,
            volume,
            created_at: Utc::now(),
        };
        if let Err(e) = self.wait_for_init(&entry.handle).await {
            self.release(&entry).await;
            return Err(e);
        }
        Ok(entry)
    }

    /// Block until the init process exits.
    async fn wait_for_init(&self, handle: &SandboxHandle) -> CoreResult<()> {
        let poll = self.sandbox.liveness_poll();
        let wait = async {
            loop {
                if !self.provider.poll_liveness(handle).await? {
                    return Ok::<(), CoreError>(());
                }
                tokio::time::sleep(poll).await;
            }
        };
        match tokio::time::timeout(self.config.provision_timeout(), wait).await {
            Ok(result) => result,
            Err(_) => Err(promptstack_sandbox::SandboxError::Timeout(self.config.provision_timeout()).into()),
        }
    }

    /// Best-effort removal of an entry's sandbox and volume.
    async fn release(&self, entry: &PooledSandbox) {
        if let Err(e) = self.provider.terminate(&entry.handle).await {
            if !e.is_gone() {
                warn!(sandbox = %entry.handle.id, error = %e, "Failed to terminate pooled sandbox");
            }
        }
        if let Err(e) = self.provider.delete_volume(&entry.volume).await {
            warn!(volume = %entry.volume.name, error = %e, "Failed to delete pooled volume");
        }
    }

    async fn remember(&self, entry: &PooledSandbox) -> CoreResult<()> {
        self.storage
            .write(&["pool", &entry.template_id, &entry.handle.id], entry)
            .await?;
        Ok(())
    }

    async fn forget(&self, entry: &PooledSandbox) -> CoreResult<()> {
        self.storage
            .remove(&["pool", &entry.template_id, &entry.handle.id])
            .await?;
        Ok(())
    }

    pub fn target_size(&self) -> usize {
        self.config.target_size
    }

    pub fn provision_timeout(&self) -> Duration {
        self.config.provision_timeout()
    }
}
