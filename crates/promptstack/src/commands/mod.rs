//! Command handlers for the promptstack CLI.

pub mod logging;
pub mod prepare;
pub mod serve;
pub mod stacks;

pub use logging::*;
pub use prepare::*;
pub use serve::*;
pub use stacks::*;
