//! Durable project records.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use promptstack_sandbox::{SandboxHandle, VolumeRef};
use promptstack_storage::{Storage, StorageExt};
use promptstack_util::Identifier;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A project's persisted sandbox binding. Survives restarts so the sandbox
/// and volume can be reattached instead of recreated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectHandle {
    pub project_id: String,
    pub name: String,
    pub stack_id: String,
    #[serde(default)]
    pub sandbox: Option<SandboxHandle>,
    #[serde(default)]
    pub volume: Option<VolumeRef>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProjectHandle {
    pub fn new(name: impl Into<String>, stack_id: impl Into<String>) -> Self {
        Self {
            project_id: Identifier::project(),
            name: name.into(),
            stack_id: stack_id.into(),
            sandbox: None,
            volume: None,
            last_used_at: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct ProjectStore {
    storage: Arc<dyn Storage>,
}

impl ProjectStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn create(&self, name: &str, stack_id: &str) -> CoreResult<ProjectHandle> {
        let project = ProjectHandle::new(name, stack_id);
        self.save(&project).await?;
        debug!(project_id = %project.project_id, stack = stack_id, "Created project");
        Ok(project)
    }

    pub async fn find(&self, project_id: &str) -> CoreResult<Option<ProjectHandle>> {
        Ok(self.storage.read(&["project", project_id]).await?)
    }

    pub async fn get(&self, project_id: &str) -> CoreResult<ProjectHandle> {
        self.find(project_id)
            .await?
            .ok_or_else(|| CoreError::ProjectNotFound(project_id.to_string()))
    }

    pub async fn save(&self, project: &ProjectHandle) -> CoreResult<()> {
        Ok(self
            .storage
            .write(&["project", &project.project_id], project)
            .await?)
    }

    /// Read-modify-write of an existing project.
    pub async fn update<F>(&self, project_id: &str, editor: F) -> CoreResult<ProjectHandle>
    where
        F: FnOnce(&mut ProjectHandle) + Send,
    {
        let mut project = self.get(project_id).await?;
        editor(&mut project);
        self.save(&project).await?;
        Ok(project)
    }

    pub async fn touch(&self, project_id: &str) -> CoreResult<()> {
        self.update(project_id, |p| p.last_used_at = Some(Utc::now()))
            .await
            .map(|_| ())
    }

    pub async fn list(&self) -> CoreResult<Vec<ProjectHandle>> {
        Ok(self.storage.read_all(&["project"]).await?)
    }

    /// Projects holding a sandbox that has not been used since `cutoff`.
    pub async fn stale(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<ProjectHandle>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|p| p.sandbox.is_some())
            .filter(|p| p.last_used_at.is_some_and(|t| t < cutoff))
            .collect())
    }
}
