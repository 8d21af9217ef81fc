//! HTTP and WebSocket surface for promptstack.
//!
//! Viewers create a chat over REST and then hold one WebSocket per chat.
//! Everything else (booting, turns, status fan-out) lives in the engine.

pub mod routes;
pub mod state;
pub mod ws;

pub use routes::create_router;
pub use state::AppState;
pub use ws::WsViewer;

use std::future::Future;
use std::net::SocketAddr;
use tracing::info;

/// Bind `address` and serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, address: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "Server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
