//! HTTP ingestion into per-stream bus topics, with processed results pushed
//! back to WebSocket subscribers.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod metrics;
pub mod publisher;
pub mod push;
pub mod rate_gate;
pub mod results;
pub mod routes;
pub mod session;
pub mod state;
pub mod subscriber;
pub mod telemetry;
pub mod transform;

use std::{future::Future, sync::Arc};

use tokio::net::TcpListener;
use tracing::info;

pub use config::{Cli, RelayConfig};
pub use state::AppState;

/// Serves the relay on `listener` until `shutdown` resolves, then closes every
/// push connection and session.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = routes::router(state.clone());
    if let Ok(addr) = listener.local_addr() {
        info!(listen_addr = %addr, "stream-relay listening");
    }
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    state.shutdown().await;
    served
}
