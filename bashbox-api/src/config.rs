//! Environment-driven configuration.
//!
//! The coordinator is configured entirely through its environment; a `.env`
//! file is honoured when present. Setting `WORKER_APP=mock` switches to the
//! subprocess-backed pool, which needs only a fraction of the settings.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context};

/// The worker-app value selecting the mock pool.
pub const MOCK_APP: &str = "mock";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Fabric app the worker machines live in, or `mock`.
    pub worker_app: String,
    /// Image each worker machine runs.
    pub worker_image: String,
    /// Control-plane API token.
    pub api_token: String,
    /// Budget for one proxied request.
    pub max_req_time: Duration,
    pub region: String,
    /// This coordinator's machine id; doubles as the pool identity.
    pub machine_id: String,
    pub pool_size: usize,
    /// Hex private key used to sign per-request worker tokens.
    pub private_key: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let worker_app = env::var("WORKER_APP").unwrap_or_default();
        let worker_image = env::var("WORKER_IMAGE").unwrap_or_default();
        let api_token = env::var("FLY_TOKEN").unwrap_or_default();
        let max_req_time = env::var("MAXREQTIME").unwrap_or_default();
        let mut region = env::var("FLY_REGION").unwrap_or_default();
        let mut machine_id = env::var("FLY_MACHINE_ID").unwrap_or_default();
        let pool_size = env::var("POOLSIZE").unwrap_or_default();
        let private_key = env::var("PRIVATE").unwrap_or_default();

        let mock = worker_app == MOCK_APP;
        if mock {
            if max_req_time.is_empty() || private_key.is_empty() {
                bail!("need: MAXREQTIME, PRIVATE");
            }
        } else if worker_app.is_empty()
            || worker_image.is_empty()
            || api_token.is_empty()
            || max_req_time.is_empty()
            || machine_id.is_empty()
            || pool_size.is_empty()
            || private_key.is_empty()
        {
            bail!("need: WORKER_APP, WORKER_IMAGE, FLY_TOKEN, MAXREQTIME, FLY_MACHINE_ID, POOLSIZE, PRIVATE");
        }

        if region.is_empty() {
            region = "qmx".to_string();
        }
        if machine_id.is_empty() {
            machine_id = "local".to_string();
        }

        let max_req_time = humantime::parse_duration(&max_req_time).context("MAXREQTIME")?;
        let pool_size = if mock {
            1
        } else {
            pool_size.parse().context("POOLSIZE")?
        };

        Ok(Self {
            worker_app,
            worker_image,
            api_token,
            max_req_time,
            region,
            machine_id,
            pool_size,
            private_key,
        })
    }

    pub fn is_mock(&self) -> bool {
        self.worker_app == MOCK_APP
    }
}
