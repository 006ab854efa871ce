//! bashbox coordinator.
//!
//! The coordinator fronts a bash-as-a-service platform running on a VM
//! fabric: each `POST /run` is admitted, bound to a dedicated single-use
//! worker machine from a managed pool, proxied with a signed per-request
//! token, and streamed back to the caller while the machine is recycled
//! behind the scenes.
//!
//! # Architecture
//!
//! - [`machines`]: typed client for the VM control plane
//! - [`pool`]: the worker machine pool — allocation, leases, recycling,
//!   orphan reclaim — plus a subprocess-backed mock
//! - [`gateway`]: the request pipeline (rate limiting, allocation, signed
//!   delegation, streaming proxy with replay hints)
//! - [`stats`]: online per-operation statistics
//! - [`config`]: environment-driven configuration
//! - [`server`]: router assembly and signal-driven lifecycle

pub mod config;
pub mod gateway;
pub mod machines;
pub mod pool;
pub mod server;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use bashbox_auth::Signer;

use gateway::rate_limit::RateLimiter;
use pool::WorkerPool;
use stats::Collector;

/// Request-pipeline timings.
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Whole-request handling time.
    pub request: Collector,
    /// Time spent reaching the worker, including connection retries.
    pub proxy: Collector,
}

/// State shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<dyn WorkerPool>,
    pub signer: Arc<Signer>,
    pub http: reqwest::Client,
    pub limiter: Arc<RateLimiter>,
    pub stats: Arc<GatewayStats>,
    /// This coordinator's machine id, echoed on every response.
    pub machine_id: String,
    /// Budget for one proxied request, connection retries included.
    pub max_req_time: Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("machine_id", &self.machine_id)
            .field("max_req_time", &self.max_req_time)
            .finish()
    }
}
