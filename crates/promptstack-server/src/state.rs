//! Server state.

use promptstack_core::{Engine, ProjectRegistry};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Live orchestrators, one per project with viewers.
    pub registry: Arc<ProjectRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<ProjectRegistry>) -> Self {
        Self {
            engine: registry.engine().clone(),
            registry,
        }
    }
}
