//! bashbox worker - main entry point.

use std::future::IntoFuture;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bashbox_worker::{create_app, WorkerState};

/// How long a verified token stays acceptable after signing.
const TOKEN_LIVENESS: Duration = Duration::from_secs(5);
/// How long graceful shutdown may drain the response.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "bashbox-worker")]
#[command(about = "bashbox worker - runs one shell command and streams its output")]
#[command(version)]
struct Args {
    /// Port to listen on.
    #[arg(short, long, env = "PORT", default_value = "8001")]
    port: u16,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let machine_id = std::env::var("FLY_MACHINE_ID").context("need FLY_MACHINE_ID")?;
    let public_key = std::env::var("PUBLIC").context("need PUBLIC")?;

    let verifier = bashbox_auth::Verifier::new(&public_key, &machine_id, TOKEN_LIVENESS)
        .map_err(|err| anyhow::anyhow!("parsing PUBLIC: {err}"))?;
    let state = WorkerState::new(verifier, machine_id);
    let done = state.done.clone();

    let app = create_app(state);
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("worker listening on {addr}");

    // On a signal the drain window is bounded; after serving the one request
    // the server drains the in-flight response for as long as it takes.
    let (grace_tx, grace_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    let _ = grace_tx.send(());
                }
                _ = done.notified() => {
                    tracing::info!("request served, shutting down");
                }
            }
        })
        .into_future();

    tokio::select! {
        result = server => result?,
        _ = async {
            let _ = grace_rx.await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            tracing::warn!("graceful shutdown expired, closing");
        }
    }

    tracing::info!("worker shut down");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
