//! The set of live project orchestrators.

use crate::engine::Engine;
use crate::error::CoreResult;
use crate::orchestrator::ProjectOrchestrator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Owns every [`ProjectOrchestrator`]. Handlers get one by reference; there
/// is no global instance.
pub struct ProjectRegistry {
    engine: Engine,
    orchestrators: Mutex<HashMap<String, Arc<ProjectOrchestrator>>>,
}

impl ProjectRegistry {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            orchestrators: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The project's orchestrator, created on first use.
    pub async fn get_or_create(&self, project_id: &str) -> CoreResult<Arc<ProjectOrchestrator>> {
        let mut orchestrators = self.orchestrators.lock().await;
        if let Some(existing) = orchestrators.get(project_id) {
            if !existing.is_killed() {
                return Ok(existing.clone());
            }
        }
        let orchestrator = ProjectOrchestrator::new(self.engine.clone(), project_id).await?;
        orchestrators.insert(project_id.to_string(), orchestrator.clone());
        info!(project_id, live = orchestrators.len(), "Created project orchestrator");
        Ok(orchestrator)
    }

    pub async fn lookup(&self, project_id: &str) -> Option<Arc<ProjectOrchestrator>> {
        self.orchestrators.lock().await.get(project_id).cloned()
    }

    pub async fn contains(&self, project_id: &str) -> bool {
        self.orchestrators.lock().await.contains_key(project_id)
    }

    /// Forget the orchestrator without stopping it.
    pub async fn remove(&self, project_id: &str) -> Option<Arc<ProjectOrchestrator>> {
        self.orchestrators.lock().await.remove(project_id)
    }

    /// Kill and remove the orchestrator, e.g. for an explicit restart.
    pub async fn restart(&self, project_id: &str) -> bool {
        match self.remove(project_id).await {
            Some(orchestrator) => {
                orchestrator.kill().await;
                true
            }
            None => false,
        }
    }

    /// Kill and remove orchestrators without viewers for `timeout`.
    /// Returns the ids reaped.
    pub async fn reap_idle(&self, timeout: Duration) -> Vec<String> {
        let idle: Vec<(String, Arc<ProjectOrchestrator>)> = {
            let mut orchestrators = self.orchestrators.lock().await;
            let ids: Vec<String> = orchestrators
                .iter()
                .filter(|(_, o)| o.is_idle(timeout))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| orchestrators.remove(&id).map(|o| (id, o)))
                .collect()
        };
        for (id, orchestrator) in &idle {
            info!(project_id = %id, "Reaping idle project");
            orchestrator.kill().await;
        }
        idle.into_iter().map(|(id, _)| id).collect()
    }

    pub async fn project_ids(&self) -> Vec<String> {
        self.orchestrators.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.orchestrators.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orchestrators.lock().await.is_empty()
    }

    /// Kill every orchestrator, for shutdown.
    pub async fn kill_all(&self) {
        let all: Vec<Arc<ProjectOrchestrator>> =
            self.orchestrators.lock().await.drain().map(|(_, o)| o).collect();
        futures::future::join_all(all.iter().map(|o| o.kill())).await;
    }
}
