//! Shared services every project runs on.

use crate::agent::{name_chat, ChatName};
use crate::browser::{HttpPageChecker, PageChecker};
use crate::chat::{ChatRecord, ChatStore, StorageChatStore};
use crate::config::EngineConfig;
use crate::diff::{DiffPolicy, DiffResolver, LlmDiffResolver};
use crate::error::CoreResult;
use crate::lifecycle::SandboxLifecycle;
use crate::pool::PreparedPool;
use crate::probe::{HttpProbe, Probe};
use crate::stacks::StackCatalog;
use crate::store::{ProjectHandle, ProjectStore};
use chrono::Local;
use promptstack_provider::{create_model, BoxedLanguageModel};
use promptstack_sandbox::ResourceProvider;
use promptstack_storage::Storage;
use std::sync::Arc;
use tracing::info;

/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    provider: Arc<dyn ResourceProvider>,
    pool: Arc<PreparedPool>,
    projects: ProjectStore,
    chats: Arc<dyn ChatStore>,
    catalog: StackCatalog,
    main_model: BoxedLanguageModel,
    fast_model: BoxedLanguageModel,
    probe: Arc<dyn Probe>,
    browser: Arc<dyn PageChecker>,
    resolver: Arc<dyn DiffResolver>,
    diff_policy: Arc<DiffPolicy>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    provider: Arc<dyn ResourceProvider>,
    storage: Arc<dyn Storage>,
    catalog: StackCatalog,
    models: Option<(BoxedLanguageModel, BoxedLanguageModel)>,
    chats: Option<Arc<dyn ChatStore>>,
    probe: Option<Arc<dyn Probe>>,
    browser: Option<Arc<dyn PageChecker>>,
    resolver: Option<Arc<dyn DiffResolver>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig, provider: Arc<dyn ResourceProvider>, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            provider,
            storage,
            catalog: StackCatalog::builtin(),
            models: None,
            chats: None,
            probe: None,
            browser: None,
            resolver: None,
        }
    }

    pub fn catalog(mut self, catalog: StackCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Use these models instead of building them from the config.
    pub fn models(mut self, main: BoxedLanguageModel, fast: BoxedLanguageModel) -> Self {
        self.models = Some((main, fast));
        self
    }

    pub fn chats(mut self, chats: Arc<dyn ChatStore>) -> Self {
        self.chats = Some(chats);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn browser(mut self, browser: Arc<dyn PageChecker>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn DiffResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> CoreResult<Engine> {
        let (main_model, fast_model) = match self.models {
            Some(models) => models,
            None => {
                let model = &self.config.model;
                let key = model.api_key.as_deref();
                let url = model.base_url.as_deref();
                (
                    create_model(&model.provider, &model.main_model, key, url)?,
                    create_model(&model.provider, &model.fast_model, key, url)?,
                )
            }
        };
        let diff_policy = Arc::new(DiffPolicy::from_config(&self.config.diff)?);
        let pool = Arc::new(PreparedPool::new(
            self.provider.clone(),
            self.storage.clone(),
            self.catalog.clone(),
            self.config.pool.clone(),
            self.config.sandbox.clone(),
        ));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(LlmDiffResolver::new(fast_model.clone())));
        let chats = self
            .chats
            .unwrap_or_else(|| Arc::new(StorageChatStore::new(self.storage.clone())));

        info!(
            provider = self.provider.name(),
            model = %main_model.model_info().id,
            fast_model = %fast_model.model_info().id,
            stacks = self.catalog.all().len(),
            "Engine ready"
        );
        Ok(Engine {
            config: Arc::new(self.config),
            provider: self.provider,
            pool,
            projects: ProjectStore::new(self.storage),
            chats,
            catalog: self.catalog,
            main_model,
            fast_model,
            probe: self.probe.unwrap_or_else(|| Arc::new(HttpProbe::default())),
            browser: self.browser.unwrap_or_else(|| Arc::new(HttpPageChecker::default())),
            resolver,
            diff_policy,
        })
    }
}

impl Engine {
    pub fn builder(config: EngineConfig, provider: Arc<dyn ResourceProvider>, storage: Arc<dyn Storage>) -> EngineBuilder {
        EngineBuilder::new(config, provider, storage)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn ResourceProvider> {
        &self.provider
    }

    pub fn pool(&self) -> &Arc<PreparedPool> {
        &self.pool
    }

    pub fn projects(&self) -> &ProjectStore {
        &self.projects
    }

    pub fn chats(&self) -> &Arc<dyn ChatStore> {
        &self.chats
    }

    pub fn catalog(&self) -> &StackCatalog {
        &self.catalog
    }

    pub fn main_model(&self) -> &BoxedLanguageModel {
        &self.main_model
    }

    pub fn fast_model(&self) -> &BoxedLanguageModel {
        &self.fast_model
    }

    pub fn browser(&self) -> &Arc<dyn PageChecker> {
        &self.browser
    }

    pub fn resolver(&self) -> &Arc<dyn DiffResolver> {
        &self.resolver
    }

    pub fn diff_policy(&self) -> &Arc<DiffPolicy> {
        &self.diff_policy
    }

    /// A lifecycle for `project`, starting `Offline`.
    pub fn lifecycle_for(&self, project: &ProjectHandle) -> CoreResult<SandboxLifecycle> {
        let template = self.catalog.get(&project.stack_id)?.clone();
        Ok(SandboxLifecycle::new(
            project.project_id.clone(),
            template,
            self.config.sandbox.clone(),
            self.provider.clone(),
            self.pool.clone(),
            self.projects.clone(),
            self.probe.clone(),
        ))
    }

    /// Create a project on `stack_id` with its first chat, named from the
    /// seed prompt when there is one.
    pub async fn create_chat(
        &self,
        stack_id: &str,
        seed_prompt: Option<&str>,
    ) -> CoreResult<(ProjectHandle, ChatRecord)> {
        self.catalog.get(stack_id)?;
        let name = match seed_prompt.map(str::trim).filter(|s| !s.is_empty()) {
            Some(seed) => name_chat(self.fast_model.as_ref(), seed).await,
            None => ChatName::fallback(Local::now().date_naive()),
        };
        let project = self.projects.create(&name.project, stack_id).await?;
        let chat = self.chats.create_chat(&project.project_id, &name.session).await?;
        info!(project_id = %project.project_id, chat_id = %chat.chat_id, stack = stack_id, "Created chat");
        Ok((project, chat))
    }
}
