//! Wire types shared between the promptstack server and chat viewers.
//!
//! Viewers hold one WebSocket per chat. The server pushes [`ViewerEvent`]s
//! (JSON objects discriminated by `for_type`) and the viewer sends
//! [`ClientMessage`]s for each user prompt.

mod event;
mod message;
mod state;
mod viewer;

pub use event::ViewerEvent;
pub use message::{ChatImage, ChatMessage, ClientMessage, Role};
pub use state::SandboxState;
pub use viewer::{BoxedViewer, ViewerClosed, ViewerConnection};
