//! Single-machine pool backed by a local subprocess.
//!
//! Stands in for the real pool during development and tests: the one handle
//! points at a worker process spawned on localhost, and freeing the handle
//! kills the process.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::pool::mach::Mach;
use crate::pool::{PoolError, Worker, WorkerPool};

const MOCK_MACH_ID: &str = "m8001";
const MOCK_INSTANCE_ID: &str = "INSTANCEID";
const MOCK_URL: &str = "http://localhost:8001";

/// Time the worker process gets to bring up its listener.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

pub struct MockPool {
    cmd: String,
    args: Vec<String>,

    free_tx: mpsc::Sender<Arc<Mach>>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Mach>>>,
    child: Mutex<Option<Child>>,
    weak: Weak<MockPool>,
}

impl MockPool {
    pub fn new(cmd: impl Into<String>, args: &[&str]) -> Arc<Self> {
        let (free_tx, free_rx) = mpsc::channel(1);
        let mach = Mach::detached("mock", MOCK_MACH_ID, MOCK_INSTANCE_ID, MOCK_URL);
        // Fresh channel of capacity one; this cannot fail.
        let _ = free_tx.try_send(mach);

        Arc::new_cyclic(|weak| Self {
            cmd: cmd.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            free_tx,
            free_rx: tokio::sync::Mutex::new(free_rx),
            child: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    fn free_mach(&self, mach: Arc<Mach>) {
        debug!(id = %mach.id(), "mock pool: free");
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
            let _ = self.free_tx.try_send(mach);
        }
    }

    fn kill_child(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }
}

#[async_trait]
impl WorkerPool for MockPool {
    async fn alloc(&self, wait_for_free: bool) -> Result<Option<Worker>, PoolError> {
        debug!("mock pool: alloc");
        let mach = {
            let mut rx = self.free_rx.lock().await;
            if wait_for_free {
                match rx.recv().await {
                    Some(mach) => mach,
                    None => return Err(PoolError::Closed),
                }
            } else {
                match rx.try_recv() {
                    Ok(mach) => mach,
                    Err(_) => return Ok(None),
                }
            }
        };

        info!(id = %mach.id(), "mock pool: starting machine");
        let child = match Command::new(&self.cmd)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                let _ = self.free_tx.try_send(mach);
                return Err(err.into());
            }
        };

        // Give the process a moment to bind its listener.
        tokio::time::sleep(STARTUP_GRACE).await;
        *self.child.lock() = Some(child);

        info!(id = %mach.id(), "mock pool: started machine");
        let weak = self.weak.clone();
        Ok(Some(Worker::new(mach, move |mach| {
            if let Some(pool) = weak.upgrade() {
                pool.free_mach(mach);
            }
        })))
    }

    async fn close(&self) -> Result<(), PoolError> {
        info!("mock pool: close");
        self.kill_child();
        Ok(())
    }

    async fn destroy(&self) -> Result<(), PoolError> {
        self.close().await
    }
}
