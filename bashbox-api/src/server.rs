//! Router assembly and server lifecycle.

use std::future::IntoFuture;
use std::time::Duration;

use axum::{middleware, routing::post, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::gateway;
use crate::AppState;

/// Builds the coordinator application with all routes and middleware.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/run", post(gateway::proxy::run))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gateway::rate_limit::rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs the server until it exits or SIGINT/SIGTERM arrives. On a signal, a
/// graceful shutdown gets `grace` to drain connections before the server is
/// dropped on the floor.
pub async fn run_with_signals(
    listener: TcpListener,
    app: Router,
    grace: Duration,
) -> anyhow::Result<()> {
    let (grace_tx, grace_rx) = tokio::sync::oneshot::channel::<()>();

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = grace_tx.send(());
        })
        .into_future();

    tokio::select! {
        result = server => result.map_err(Into::into),
        _ = async {
            // Armed only once the signal fires.
            let _ = grace_rx.await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!("graceful shutdown expired, closing");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
