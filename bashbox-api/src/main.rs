//! bashbox coordinator - main entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bashbox_api::config::AppConfig;
use bashbox_api::gateway::rate_limit::RateLimiter;
use bashbox_api::machines::Machines;
use bashbox_api::pool::{FlyPool, MockPool, PoolConfig, WorkerPool};
use bashbox_api::server::{create_app, run_with_signals};
use bashbox_api::{AppState, GatewayStats};
use bashbox_auth::Signer;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Port the worker process listens on inside its machine.
const WORKER_PORT: u16 = 8001;
/// Requests per second and burst allowed per source address.
const RATE_LIMIT_PER_SECOND: u32 = 6;
const RATE_LIMIT_BURST: u32 = 2;
const RATE_LIMIT_TTL: Duration = Duration::from_secs(60);
/// How long graceful shutdown may drain connections.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "bashbox-api")]
#[command(about = "bashbox coordinator - dispatches shell commands to pooled worker machines")]
#[command(version)]
struct Args {
    /// Host to bind to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, env = "PORT", default_value = "8000")]
    port: u16,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    tracing::info!("starting bashbox coordinator v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    tracing::info!(mock = config.is_mock(), "configuration loaded");

    let pool: Arc<dyn WorkerPool> = if config.is_mock() {
        tracing::info!("using mock pool");
        MockPool::new("bashbox-worker", &[])
    } else {
        tracing::info!(
            app = %config.worker_app,
            image = %config.worker_image,
            size = config.pool_size,
            "using fabric pool"
        );
        FlyPool::new(
            Machines::internal(&config.api_token),
            &config.machine_id,
            &config.worker_app,
            &config.worker_image,
            PoolConfig {
                capacity: config.pool_size,
                port: WORKER_PORT,
                region: config.region.clone(),
                // A worker must be able to outlive two full requests.
                worker_time: config.max_req_time * 2,
                lease_time: Duration::from_secs(5 * 60),
                ..PoolConfig::default()
            },
        )
    };

    let signer = Signer::new(&config.private_key)
        .map_err(|err| anyhow::anyhow!("parsing PRIVATE: {err}"))?;

    let state = AppState {
        pool: pool.clone(),
        signer: Arc::new(signer),
        http: reqwest::Client::new(),
        limiter: Arc::new(RateLimiter::new(
            RATE_LIMIT_PER_SECOND,
            RATE_LIMIT_BURST,
            RATE_LIMIT_TTL,
        )),
        stats: Arc::new(GatewayStats::default()),
        machine_id: config.machine_id.clone(),
        max_req_time: config.max_req_time,
    };

    let app = create_app(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {addr}");

    let result = run_with_signals(listener, app, SHUTDOWN_GRACE).await;

    if let Err(err) = pool.close().await {
        tracing::warn!(error = %err, "pool close failed");
    }

    tracing::info!("coordinator shut down");
    result
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
