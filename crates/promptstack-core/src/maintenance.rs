//! Periodic housekeeping: pool upkeep, idle projects and stale sandboxes.

use crate::registry::ProjectRegistry;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: usize,
    pub provisioned: usize,
    pub reaped: Vec<String>,
    pub stopped: Vec<String>,
}

/// Run one pass. The three jobs run concurrently and each logs its own
/// failures.
pub async fn run_once(registry: &ProjectRegistry) -> MaintenanceReport {
    let (pool, reaped, stopped) = tokio::join!(
        maintain_pool(registry),
        reap_idle(registry),
        stop_stale_sandboxes(registry),
    );
    let report = MaintenanceReport {
        evicted: pool.0,
        provisioned: pool.1,
        reaped,
        stopped,
    };
    debug!(?report, "Maintenance pass finished");
    report
}

async fn maintain_pool(registry: &ProjectRegistry) -> (usize, usize) {
    let pool = registry.engine().pool();
    let evicted = pool.evict_stale().await;
    let provisioned = pool.top_up().await;
    (evicted, provisioned)
}

async fn reap_idle(registry: &ProjectRegistry) -> Vec<String> {
    let timeout = registry.engine().config().orchestrator.idle_timeout();
    registry.reap_idle(timeout).await
}

/// Terminate sandboxes of projects nobody has used recently and nobody is
/// viewing. Volumes are kept.
async fn stop_stale_sandboxes(registry: &ProjectRegistry) -> Vec<String> {
    let engine = registry.engine();
    let timeout = engine.config().orchestrator.stale_resource_timeout();
    let Ok(timeout) = chrono::Duration::from_std(timeout) else {
        return Vec::new();
    };
    let stale = match engine.projects().stale(Utc::now() - timeout).await {
        Ok(stale) => stale,
        Err(e) => {
            warn!(error = %e, "Failed to list stale projects");
            return Vec::new();
        }
    };

    let mut stopped = Vec::new();
    for project in stale {
        let Some(handle) = project.sandbox.clone() else {
            continue;
        };
        if registry.contains(&project.project_id).await {
            continue;
        }
        if let Err(e) = engine.provider().terminate(&handle).await {
            if !e.is_gone() {
                warn!(project_id = %project.project_id, sandbox = %handle.id, error = %e, "Failed to stop stale sandbox");
                continue;
            }
        }
        let cleared = engine
            .projects()
            .update(&project.project_id, |p| {
                p.sandbox = None;
                p.expires_at = None;
            })
            .await;
        match cleared {
            Ok(_) => {
                info!(project_id = %project.project_id, sandbox = %handle.id, "Stopped stale sandbox");
                stopped.push(project.project_id);
            }
            Err(e) => warn!(project_id = %project.project_id, error = %e, "Failed to clear stale sandbox"),
        }
    }
    stopped
}

/// Run [`run_once`] every `maintenance.interval` until `cancel` fires.
/// Returns `None` when maintenance is disabled.
pub fn spawn(registry: Arc<ProjectRegistry>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
    let config = registry.engine().config().maintenance.clone();
    if !config.enabled {
        info!("Periodic maintenance disabled");
        return None;
    }
    let interval = config.interval();
    info!(interval_secs = interval.as_secs(), "Starting periodic maintenance");
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    run_once(&registry).await;
                }
            }
        }
        debug!("Periodic maintenance stopped");
    }))
}
