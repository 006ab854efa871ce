//! Worker machine pools.
//!
//! A pool hands out single-use worker VMs. [`FlyPool`] manages real machines
//! through the control plane; [`MockPool`] backs a single handle with a local
//! subprocess for development and tests. Both are used through [`WorkerPool`]
//! so the request pipeline does not care which one it is running against.

pub mod fly;
pub mod mach;
pub mod mock;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::machines::{MachinesError, OkResp};

pub use fly::{FlyPool, PoolConfig};
pub use mach::{Mach, MachState};
pub use mock::MockPool;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("the pool is closed")]
    Closed,
    #[error("machine {0} has not been created yet")]
    Nascent(String),
    #[error("control plane reported !ok")]
    NotOk,
    #[error("lease request returned status {0:?}")]
    LeaseStatus(String),
    #[error(transparent)]
    Machines(#[from] MachinesError),
    #[error("spawning worker process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("cleanup failed: {0}")]
    Cleanup(String),
}

pub(crate) fn check_ok(resp: OkResp) -> Result<(), PoolError> {
    if resp.ok {
        Ok(())
    } else {
        Err(PoolError::NotOk)
    }
}

/// A pool of worker machines.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Allocates a started machine. With `wait_for_free` set, blocks until a
    /// machine frees up; otherwise `Ok(None)` means no worker is available
    /// right now.
    async fn alloc(&self, wait_for_free: bool) -> Result<Option<Worker>, PoolError>;

    /// Shuts the pool down and stops its machines, keeping them around for a
    /// future pool with the same identity to reclaim.
    async fn close(&self) -> Result<(), PoolError>;

    /// Shuts the pool down and destroys its machines.
    async fn destroy(&self) -> Result<(), PoolError>;
}

type FreeFn = Box<dyn FnOnce(Arc<Mach>) + Send + Sync>;

/// An allocated worker. Dropping it returns the machine to its pool; the
/// stop-and-requeue happens in the background, so callers never wait.
///
/// Dropping a worker after the pool has shut down is an error and may panic
/// if no runtime is available to run the requeue task.
pub struct Worker {
    mach: Arc<Mach>,
    free: Option<FreeFn>,
}

impl Worker {
    pub fn new(mach: Arc<Mach>, free: impl FnOnce(Arc<Mach>) + Send + Sync + 'static) -> Self {
        Self {
            mach,
            free: Some(Box::new(free)),
        }
    }

    /// Base URL at which the worker is reached.
    pub fn url(&self) -> &str {
        self.mach.url()
    }

    /// Control-plane machine id.
    pub fn id(&self) -> String {
        self.mach.id()
    }

    pub fn name(&self) -> &str {
        self.mach.name()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(free) = self.free.take() {
            free(self.mach.clone());
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.mach.name())
            .field("id", &self.mach.id())
            .field("url", &self.mach.url())
            .finish()
    }
}
