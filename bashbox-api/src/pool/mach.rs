//! Per-machine handle and lifecycle operations.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::machines::{LeaseReq, MachineResp, ReqOpts};
use crate::pool::fly::FlyPool;
use crate::pool::{check_ok, PoolError};

const START_RETRY_TIMES: u32 = 4;
const START_RETRY_WAIT: Duration = Duration::from_millis(50);
const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachState {
    Nascent,
    Started,
    Stopped,
    Destroyed,
}

impl MachState {
    pub fn as_str(self) -> &'static str {
        match self {
            MachState::Nascent => "nascent",
            MachState::Started => "started",
            MachState::Stopped => "stopped",
            MachState::Destroyed => "destroyed",
        }
    }

    /// Maps a control-plane state string. Anything we do not track maps to
    /// `Nascent` so lifecycle operations treat the machine conservatively.
    fn from_api(state: &str) -> Self {
        match state {
            "started" => MachState::Started,
            "stopped" => MachState::Stopped,
            "destroyed" => MachState::Destroyed,
            _ => MachState::Nascent,
        }
    }
}

#[derive(Debug)]
struct MachInner {
    id: String,
    instance_id: String,
    lease_nonce: String,
    lease_expires: DateTime<Utc>,
    state: MachState,
}

/// A machine in a pool.
///
/// A machine is owned by a pool if it holds an unexpired lease and carries
/// `pool_id` metadata matching the pool's. When a pool restarts with the same
/// machine id and worker image, its `pool_id` is the same and it can take
/// ownership of any owned machines it finds.
#[derive(Debug)]
pub struct Mach {
    name: String,
    url: String,
    pool: Weak<FlyPool>,
    inner: Mutex<MachInner>,
}

impl Mach {
    /// A handle that has reserved a pool slot but has no machine behind it
    /// yet. The creator fills in id, instance id and nonce once the control
    /// plane responds.
    pub(crate) fn nascent(
        pool: &Arc<FlyPool>,
        name: String,
        lease_expires: DateTime<Utc>,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: format!("http://{}.flycast", pool.app_name()),
            name,
            pool: Arc::downgrade(pool),
            inner: Mutex::new(MachInner {
                id: String::new(),
                instance_id: String::new(),
                lease_nonce: String::new(),
                lease_expires,
                state: MachState::Nascent,
            }),
        })
    }

    /// A handle built from a control-plane listing, used when adopting
    /// orphans.
    pub(crate) fn from_listing(
        pool: &Arc<FlyPool>,
        resp: &MachineResp,
        lease_nonce: String,
        lease_expires: DateTime<Utc>,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: format!("http://{}.flycast", pool.app_name()),
            name: resp.name.clone(),
            pool: Arc::downgrade(pool),
            inner: Mutex::new(MachInner {
                id: resp.id.clone(),
                instance_id: resp.instance_id.clone(),
                lease_nonce,
                lease_expires,
                state: MachState::from_api(&resp.state),
            }),
        })
    }

    /// A free-standing handle with no backing pool, for the mock pool and
    /// tests.
    pub fn detached(name: &str, id: &str, instance_id: &str, url: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            url: url.to_string(),
            pool: Weak::new(),
            inner: Mutex::new(MachInner {
                id: id.to_string(),
                instance_id: instance_id.to_string(),
                lease_nonce: String::new(),
                lease_expires: DateTime::<Utc>::MIN_UTC,
                state: MachState::Started,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    pub(crate) fn lease_expires(&self) -> DateTime<Utc> {
        self.inner.lock().lease_expires
    }

    /// True if the lease has at least `dt` left.
    pub(crate) fn lease_sufficient(&self, dt: TimeDelta) -> bool {
        self.lease_expires() > Utc::now() + dt
    }

    pub(crate) fn set_created(&self, id: String, instance_id: String, lease_nonce: String) {
        let mut inner = self.inner.lock();
        inner.id = id;
        inner.instance_id = instance_id;
        inner.lease_nonce = lease_nonce;
    }

    fn pool(&self) -> Result<Arc<FlyPool>, PoolError> {
        self.pool.upgrade().ok_or(PoolError::Closed)
    }

    /// Polls the control plane until the machine reaches `target`.
    pub(crate) async fn wait_for(&self, target: MachState) -> Result<(), PoolError> {
        let pool = self.pool()?;
        let (id, instance_id, nonce) = {
            let inner = self.inner.lock();
            if inner.id.is_empty() {
                return Err(PoolError::Nascent(self.name.clone()));
            }
            (
                inner.id.clone(),
                inner.instance_id.clone(),
                inner.lease_nonce.clone(),
            )
        };

        debug!(name = %self.name, id = %id, state = target.as_str(), "pool: wait for");
        let resp = pool
            .api()
            .wait_for(
                pool.app_name(),
                &id,
                &instance_id,
                WAIT_TIMEOUT,
                target.as_str(),
                ReqOpts::lease_nonce(&nonce),
            )
            .await?;
        check_ok(resp)?;

        self.inner.lock().state = target;
        Ok(())
    }

    /// Starts the machine, retrying on 412 Precondition Failed: a freshly
    /// stopped machine may not have fully quiesced yet.
    pub(crate) async fn start(&self) -> Result<(), PoolError> {
        let pool = self.pool()?;
        let (id, nonce) = {
            let inner = self.inner.lock();
            if inner.id.is_empty() {
                return Err(PoolError::Nascent(self.name.clone()));
            }
            if inner.state == MachState::Started {
                return Ok(());
            }
            (inner.id.clone(), inner.lease_nonce.clone())
        };

        debug!(name = %self.name, id = %id, "pool: start");
        let _timer = pool.stats().start.start();

        let mut wait = START_RETRY_WAIT;
        let mut precondition_failed = None;
        for _ in 0..START_RETRY_TIMES {
            match pool
                .api()
                .start(pool.app_name(), &id, ReqOpts::lease_nonce(&nonce))
                .await
            {
                Ok(_) => {
                    precondition_failed = None;
                    break;
                }
                Err(err) if err.is_status(StatusCode::PRECONDITION_FAILED) => {
                    warn!(name = %self.name, id = %id, error = %err, "pool: start precondition failed, retrying");
                    tokio::time::sleep(wait).await;
                    wait *= 2;
                    precondition_failed = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(err) = precondition_failed {
            return Err(err.into());
        }

        self.wait_for(MachState::Started).await
    }

    pub(crate) async fn stop(&self) -> Result<(), PoolError> {
        let pool = self.pool()?;
        let (id, nonce) = {
            let inner = self.inner.lock();
            if inner.id.is_empty() {
                return Err(PoolError::Nascent(self.name.clone()));
            }
            if inner.state == MachState::Stopped {
                return Ok(());
            }
            (inner.id.clone(), inner.lease_nonce.clone())
        };

        debug!(name = %self.name, id = %id, "pool: stop");
        let _timer = pool.stats().stop.start();

        pool.api()
            .stop(pool.app_name(), &id, ReqOpts::lease_nonce(&nonce))
            .await?;

        self.wait_for(MachState::Stopped).await
    }

    /// Destroys the machine. A nascent handle that never materialized is a
    /// no-op, as is a handle already destroyed.
    pub(crate) async fn destroy(&self) -> Result<(), PoolError> {
        let pool = self.pool()?;
        let (id, nonce) = {
            let mut inner = self.inner.lock();
            if inner.id.is_empty() || inner.state == MachState::Destroyed {
                return Ok(());
            }
            inner.state = MachState::Destroyed;
            (inner.id.clone(), inner.lease_nonce.clone())
        };

        debug!(name = %self.name, id = %id, "pool: destroy");
        let _timer = pool.stats().destroy.start();

        let resp = pool
            .api()
            .destroy(pool.app_name(), &id, true, ReqOpts::lease_nonce(&nonce))
            .await?;
        check_ok(resp)
    }

    /// Extends the lease through the control plane, recording the new expiry
    /// locally on success.
    pub(crate) async fn update_lease(&self, expires: DateTime<Utc>) -> Result<(), PoolError> {
        let pool = self.pool()?;
        let (id, nonce) = {
            let inner = self.inner.lock();
            (inner.id.clone(), inner.lease_nonce.clone())
        };

        debug!(name = %self.name, id = %id, "pool: update lease");
        let _timer = pool.stats().lease.start();

        let ttl = (expires - Utc::now()).num_seconds();
        let req = LeaseReq {
            description: String::new(),
            ttl,
        };
        let resp = pool
            .api()
            .lease(pool.app_name(), &id, &req, ReqOpts::lease_nonce(&nonce))
            .await?;
        if resp.status != "success" {
            return Err(PoolError::LeaseStatus(resp.status));
        }

        self.inner.lock().lease_expires = expires;
        Ok(())
    }
}
