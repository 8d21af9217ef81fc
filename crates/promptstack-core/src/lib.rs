//! Sandbox lifecycle and agent orchestration for promptstack.
//!
//! This crate ties the pieces together:
//! - Configuration (file, inline JSON and environment overrides)
//! - The prepared sandbox pool and per-project sandbox lifecycle
//! - The agent turn: stream normalization, tools and the diff applier
//! - Project orchestrators, their registry and periodic maintenance

pub mod agent;
pub mod browser;
pub mod chat;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod maintenance;
pub mod normalizer;
pub mod orchestrator;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod retry;
pub mod stacks;
pub mod store;
pub mod tools;

pub use browser::{HttpPageChecker, PageCheckResult, PageChecker};
pub use chat::{ChatRecord, ChatStore, StorageChatStore};
pub use config::EngineConfig;
pub use diff::{ApplyOutcome, DiffPolicy, DiffResolver, LlmDiffResolver, StreamingDiffApplier};
pub use engine::{Engine, EngineBuilder};
pub use error::{ConfigError, CoreError, CoreResult};
pub use lifecycle::{ProjectWorkspace, SandboxLifecycle};
pub use maintenance::MaintenanceReport;
pub use normalizer::{StreamNormalizer, TurnEvent};
pub use orchestrator::ProjectOrchestrator;
pub use pool::{PoolDeficit, PooledSandbox, PreparedPool};
pub use probe::{HttpProbe, Probe};
pub use registry::ProjectRegistry;
pub use stacks::StackCatalog;
pub use store::{ProjectHandle, ProjectStore};
