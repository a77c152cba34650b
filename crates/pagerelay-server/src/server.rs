//! Server lifecycle: bind, run the liveness sweeper, serve until shutdown.

use std::future::Future;
use std::sync::Arc;

use crate::rest::router;
use crate::state::AppState;

/// Serve the HTTP API and worker endpoint on `addr` until ctrl-c.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("PageRelay listening on http://{}", listener.local_addr()?);
    serve_with_shutdown(listener, state, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sweeper = state.registry.spawn_sweeper(Arc::clone(&state.shutdown));
    let app = router(Arc::clone(&state));

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    // A stored permit reaches the sweeper even if it is mid-sweep.
    state.shutdown.notify_one();
    if let Err(e) = sweeper.await {
        tracing::warn!("Liveness sweeper ended abnormally: {e}");
    }
    for identity in state.registry.identities() {
        if let Some(connection) = state.registry.unregister(&identity) {
            connection.close();
        }
    }
    result?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
