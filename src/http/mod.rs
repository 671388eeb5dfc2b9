pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::http::routes::create_router;
use crate::http::state::AppState;

/// Serve the API on loopback until `shutdown` resolves
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
    serve_on(listener, state, shutdown).await
}

/// Serve on an already bound listener. In-flight requests finish before
/// this returns.
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    info!("HTTP API listening on {}", addr);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP API on {} stopped", addr);
    Ok(())
}
