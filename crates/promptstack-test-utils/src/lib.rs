//! Testing utilities for promptstack.
//!
//! - **Sandbox**: an in-memory [`ResourceProvider`](promptstack_sandbox::ResourceProvider)
//! - **Providers**: a language model that replays scripted streams
//! - **Viewers**: a viewer connection that records what it is sent
//! - **Assertions**: checks on observed sandbox state sequences
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use promptstack_test_utils::{MockResourceProvider, ScriptedModel};
//!
//! #[tokio::test]
//! async fn test_turn() {
//!     let provider = Arc::new(MockResourceProvider::new());
//!     let model = Arc::new(ScriptedModel::new());
//!     model.push_text(&["Hello"]);
//!     // build an engine on top of them...
//! }
//! ```

pub mod assertions;
pub mod providers;
pub mod sandbox;
pub mod viewers;

pub use assertions::{assert_state_sequence, assert_turns_serialized, is_valid_state_sequence};
pub use providers::ScriptedModel;
pub use sandbox::MockResourceProvider;
pub use viewers::RecordingViewer;
