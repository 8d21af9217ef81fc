//! `promptstack prepare-sandboxes`.

use anyhow::Context;
use promptstack_core::{EngineConfig, PreparedPool, StackCatalog};
use promptstack_sandbox::DockerProvider;
use promptstack_storage::default_storage;
use std::sync::Arc;
use tracing::info;

/// Run one evict + top-up pass, or print the deficits when `dry_run`.
pub async fn prepare_sandboxes(config: EngineConfig, dry_run: bool) -> anyhow::Result<()> {
    let storage = default_storage().context("Could not determine the data directory")?;
    let provider = DockerProvider::connect(config.docker.clone())
        .await
        .context("Could not connect to Docker")?;
    let pool = PreparedPool::new(
        Arc::new(provider),
        Arc::new(storage),
        StackCatalog::builtin(),
        config.pool.clone(),
        config.sandbox.clone(),
    );
    let restored = pool.restore().await?;
    info!(restored, "Restored prepared pool ledger");

    if dry_run {
        println!("Prepared sandboxes (target {} per stack):", pool.target_size());
        for deficit in pool.deficits() {
            println!(
                "  {:<16} {} ready, {} missing",
                deficit.template_id,
                deficit.valid,
                deficit.missing()
            );
        }
        return Ok(());
    }

    let evicted = pool.evict_stale().await;
    let provisioned = pool.top_up().await;
    println!("Evicted {evicted} stale sandbox(es), provisioned {provisioned}.");
    let short: Vec<_> = pool.deficits().into_iter().filter(|d| d.missing() > 0).collect();
    for deficit in &short {
        println!("  {} is still missing {}", deficit.template_id, deficit.missing());
    }
    if !short.is_empty() {
        anyhow::bail!("Some stacks could not be fully provisioned");
    }
    Ok(())
}
