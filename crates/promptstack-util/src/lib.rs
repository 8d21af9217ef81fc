//! Shared utilities for promptstack.
//!
//! - Prefixed ULID identifiers for projects, chats, messages, sandboxes and volumes
//! - Logging setup with tracing
//! - RAII timing of slow operations

pub mod id;
pub mod log;
pub mod timing;

pub use id::{IdPrefix, Identifier};
pub use log::{LogConfig, LogLevel};
pub use timing::TimingGuard;
