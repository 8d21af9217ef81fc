//! Shared harness for engine scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use promptstack_core::diff::DiffResolver;
use promptstack_core::{
    CoreResult, Engine, EngineConfig, PageCheckResult, PageChecker, Probe, ProjectRegistry,
};
use promptstack_storage::MemoryStorage;
use promptstack_test_utils::{MockResourceProvider, ScriptedModel};
use std::sync::{Arc, Mutex};

pub struct AlwaysReachable;

#[async_trait]
impl Probe for AlwaysReachable {
    async fn is_reachable(&self, _url: &str) -> bool {
        true
    }
}

/// Records checked URLs and reports a clean page.
#[derive(Default)]
pub struct RecordingBrowser {
    pub urls: Mutex<Vec<String>>,
}

#[async_trait]
impl PageChecker for RecordingBrowser {
    async fn check(&self, url: &str) -> PageCheckResult {
        self.urls.lock().unwrap().push(url.to_string());
        PageCheckResult::default()
    }
}

/// Returns the block body unchanged.
pub struct PassThrough;

#[async_trait]
impl DiffResolver for PassThrough {
    async fn resolve(&self, _original: Option<&str>, diff: &str, _tips: &[String]) -> CoreResult<String> {
        Ok(diff.to_string())
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pool.target_size = 1;
    config.pool.provision_timeout_secs = 5;
    config.sandbox.liveness_poll_ms = 5;
    config.sandbox.waiting_retry_secs = 1;
    config.sandbox.supervise_interval_secs = 1;
    config.sandbox.boot_timeout_secs = 5;
    config.maintenance.enabled = false;
    config
}

pub struct Harness {
    pub provider: Arc<MockResourceProvider>,
    pub model: Arc<ScriptedModel>,
    pub fast: Arc<ScriptedModel>,
    pub browser: Arc<RecordingBrowser>,
    pub storage: Arc<MemoryStorage>,
    pub engine: Engine,
    pub registry: Arc<ProjectRegistry>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        Self::build(config, Arc::new(ScriptedModel::new())).await
    }

    pub async fn with_model(model: ScriptedModel) -> Self {
        Self::build(test_config(), Arc::new(model)).await
    }

    async fn build(config: EngineConfig, model: Arc<ScriptedModel>) -> Self {
        let provider = Arc::new(MockResourceProvider::new());
        let fast = Arc::new(ScriptedModel::new());
        let browser = Arc::new(RecordingBrowser::default());
        let storage = Arc::new(MemoryStorage::new());
        let engine = Engine::builder(config, provider.clone(), storage.clone())
            .models(model.clone(), fast.clone())
            .probe(Arc::new(AlwaysReachable))
            .browser(browser.clone())
            .resolver(Arc::new(PassThrough))
            .build()
            .unwrap();
        engine.pool().top_up().await;
        let registry = Arc::new(ProjectRegistry::new(engine.clone()));
        Self {
            provider,
            model,
            fast,
            browser,
            storage,
            engine,
            registry,
        }
    }
}
