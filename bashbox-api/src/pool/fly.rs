//! Capacity-bounded pool of machines managed through the control plane.
//!
//! The free queue is the single rendezvous point between producers (growth,
//! recycling, adoption) and consumers (alloc). Discarded machines drain
//! through a background task, and a periodic cleaner reclaims machines this
//! pool owned before a restart.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::machines::{
    CreateMachineReq, Guest, LeaseData, MachineConfig, MachineResp, Machines, Port, ReqOpts,
    Restart, Service,
};
use crate::pool::mach::{Mach, MachState};
use crate::pool::{PoolError, Worker, WorkerPool};
use crate::stats::Collector;

/// Metadata key stamped into every machine this pool creates, so the pool can
/// recognise its own machines across restarts.
pub const META_POOL_KEY: &str = "pool_id";

const CLEANER_DELAY: Duration = Duration::from_secs(5 * 60);
const DISCARD_STAGGER: Duration = Duration::from_millis(100);

fn default_guest() -> Guest {
    Guest {
        cpu_kind: "shared".to_string(),
        cpus: 1,
        memory_mb: 256,
    }
}

fn new_worker_name(pool_name: &str) -> String {
    format!("worker-{}-{}", pool_name, rand::random::<u64>())
}

/// Extracts the pool tag from a `worker-<pool>-<n>` machine name.
fn parse_worker_name(name: &str) -> Option<&str> {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() != 3 || parts[0] != "worker" {
        return None;
    }
    Some(parts[1])
}

/// Pool tuning knobs; the defaults match a small interactive deployment.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of machines the pool will track at once.
    pub capacity: usize,
    /// Lease TTL requested for new and renewed leases.
    pub lease_time: Duration,
    /// Minimum lease headroom a machine must have to be allocated.
    pub worker_time: Duration,
    /// Port the worker process listens on inside the machine.
    pub port: u16,
    pub region: String,
    pub guest: Guest,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            lease_time: Duration::from_secs(30 * 60),
            worker_time: Duration::from_secs(60),
            port: 8000,
            region: String::new(),
            guest: default_guest(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    pub alloc: Collector,
    pub create: Collector,
    pub start: Collector,
    pub stop: Collector,
    pub destroy: Collector,
    pub lease: Collector,
}

#[derive(Debug, Default)]
struct PoolState {
    machs: HashMap<String, Arc<Mach>>,
    is_shutdown: bool,
}

/// A pool of machines owned by one coordinator.
pub struct FlyPool {
    api: Machines,
    name: String,
    capacity: usize,
    lease_time: TimeDelta,
    worker_time: TimeDelta,

    app_name: String,
    image: String,
    port: u16,
    region: String,
    guest: Guest,

    /// `<name>//<image>`; stamped into each machine's `pool_id` metadata.
    metadata: String,

    weak: Weak<FlyPool>,
    state: Mutex<PoolState>,
    free_tx: mpsc::Sender<Arc<Mach>>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Mach>>>,
    discard_tx: mpsc::Sender<Arc<Mach>>,

    cancel: CancellationToken,
    free_tasks: TaskTracker,
    bg_tasks: Mutex<Vec<JoinHandle<()>>>,

    stats: PoolStats,
}

impl FlyPool {
    /// Creates a pool of up to `config.capacity` machines owned by this pool.
    /// `pool_name` should be unique and stable across restarts sharing the
    /// same coordinator identity, such as the coordinator's machine id.
    pub fn new(
        api: Machines,
        pool_name: &str,
        app_name: &str,
        image: &str,
        config: PoolConfig,
    ) -> Arc<Self> {
        let capacity = config.capacity.max(1);
        let (free_tx, free_rx) = mpsc::channel(capacity);
        let (discard_tx, discard_rx) = mpsc::channel(capacity);

        let pool = Arc::new_cyclic(|weak| Self {
            api,
            name: pool_name.to_string(),
            capacity,
            lease_time: TimeDelta::from_std(config.lease_time).unwrap_or(TimeDelta::MAX),
            worker_time: TimeDelta::from_std(config.worker_time).unwrap_or(TimeDelta::MAX),
            app_name: app_name.to_string(),
            image: image.to_string(),
            port: config.port,
            region: config.region,
            guest: config.guest,
            metadata: format!("{pool_name}//{image}"),
            weak: weak.clone(),
            state: Mutex::new(PoolState::default()),
            free_tx,
            free_rx: tokio::sync::Mutex::new(free_rx),
            discard_tx,
            cancel: CancellationToken::new(),
            free_tasks: TaskTracker::new(),
            bg_tasks: Mutex::new(Vec::new()),
            stats: PoolStats::default(),
        });

        // Reclaim orphans and clean up in the background.
        let handles = vec![
            tokio::spawn(pool.clone().handle_discards(discard_rx)),
            tokio::spawn(pool.clone().run_cleaner()),
        ];
        *pool.bg_tasks.lock() = handles;

        pool
    }

    pub(crate) fn api(&self) -> &Machines {
        &self.api
    }

    pub(crate) fn app_name(&self) -> &str {
        &self.app_name
    }

    pub(crate) fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Allocates the next free machine, growing the pool if possible and
    /// blocking for a free machine only when `wait_for_free` is set.
    pub async fn alloc(&self, wait_for_free: bool) -> Result<Option<Worker>, PoolError> {
        if self.state.lock().is_shutdown {
            return Err(PoolError::Closed);
        }

        let _timer = self.stats.alloc.start();

        let Some(mach) = self.alloc_leased(wait_for_free).await? else {
            return Ok(None);
        };

        if let Err(err) = mach.start().await {
            warn!(name = %mach.name(), error = %err, "pool: mach start failed");
            self.discard_mach(&mach, "start machine failed");
            return Err(err);
        }

        info!(app = %self.app_name, name = %mach.name(), id = %mach.id(), "pool: alloc");
        Ok(Some(self.make_worker(mach)))
    }

    /// Gets the next free machine with enough lease time left, discarding any
    /// that do not. Renews leases that are short but still unexpired.
    async fn alloc_leased(&self, wait_for_free: bool) -> Result<Option<Arc<Mach>>, PoolError> {
        loop {
            let mach = match self.next_candidate(wait_for_free).await? {
                Some(mach) => mach,
                None => return Ok(None),
            };

            if mach.lease_sufficient(self.worker_time) {
                return Ok(Some(mach));
            }

            if mach.lease_expires() > Utc::now() {
                let expires = Utc::now() + self.lease_time;
                match mach.update_lease(expires).await {
                    Ok(()) => return Ok(Some(mach)),
                    Err(err) => {
                        warn!(name = %mach.name(), error = %err, "pool: alloc: extend lease failed");
                    }
                }
            }

            self.discard_mach(&mach, "not enough lease left");
            // and try again...
        }
    }

    async fn next_candidate(&self, wait_for_free: bool) -> Result<Option<Arc<Mach>>, PoolError> {
        if let Some(mach) = self.try_free() {
            return Ok(Some(mach));
        }
        if let Some(mach) = self.grow_pool().await? {
            return Ok(Some(mach));
        }
        if wait_for_free {
            return self.wait_for_free().await.map(Some);
        }
        Ok(None)
    }

    fn try_free(&self) -> Option<Arc<Mach>> {
        self.free_rx.try_lock().ok()?.try_recv().ok()
    }

    async fn wait_for_free(&self) -> Result<Arc<Mach>, PoolError> {
        if self.state.lock().is_shutdown {
            return Err(PoolError::Closed);
        }

        let mut rx = self.free_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("pool: alloc: cancelled");
                Err(PoolError::Closed)
            }
            mach = rx.recv() => mach.ok_or(PoolError::Closed),
        }
    }

    /// Creates a new machine if the pool is below capacity. The new machine
    /// is handed straight back to the caller, never via the free queue, so
    /// the caller that triggered growth cannot lose it to another waiter.
    async fn grow_pool(&self) -> Result<Option<Arc<Mach>>, PoolError> {
        let pool = self.weak.upgrade().ok_or(PoolError::Closed)?;

        // Reserve the slot under the lock; do the network work outside it.
        let nascent = {
            let mut state = self.state.lock();
            if state.is_shutdown {
                return Err(PoolError::Closed);
            }
            if state.machs.len() < self.capacity {
                let name = new_worker_name(&self.name);
                let mach = Mach::nascent(&pool, name.clone(), Utc::now() + self.lease_time);
                state.machs.insert(name, mach.clone());
                Some(mach)
            } else {
                None
            }
        };

        let Some(mach) = nascent else {
            debug!("pool: grow: at capacity");
            return Ok(None);
        };

        match self.create_mach(&mach).await {
            Ok(()) => Ok(Some(mach)),
            Err(err) => {
                warn!(name = %mach.name(), error = %err, "pool: grow: create failed");
                self.discard_mach(&mach, "create machine failed");
                Err(err)
            }
        }
    }

    async fn create_mach(&self, mach: &Arc<Mach>) -> Result<(), PoolError> {
        let _timer = self.stats.create.start();

        let lease_ttl = (mach.lease_expires() - Utc::now()).num_seconds();
        let req = CreateMachineReq {
            name: mach.name().to_string(),
            lease_ttl,
            skip_launch: false,
            region: self.region.clone(),
            config: MachineConfig {
                image: self.image.clone(),
                guest: self.guest.clone(),
                restart: Restart {
                    policy: "no".to_string(),
                },
                metadata: HashMap::from([(META_POOL_KEY.to_string(), self.metadata.clone())]),
                services: vec![Service {
                    protocol: "tcp".to_string(),
                    internal_port: self.port,
                    autostop: false,
                    autostart: false,
                    min_machines_running: 0,
                    ports: vec![Port {
                        port: 80,
                        handlers: vec!["http".to_string()],
                        force_https: false,
                    }],
                }],
                init: None,
                auto_destroy: false,
            },
        };

        info!(app = %self.app_name, name = %mach.name(), "pool: create");
        let resp = self.api.create(&self.app_name, &req).await?;
        mach.set_created(resp.id, resp.instance_id, resp.nonce);

        mach.wait_for(MachState::Started).await
    }

    fn make_worker(&self, mach: Arc<Mach>) -> Worker {
        let weak = self.weak.clone();
        Worker::new(mach, move |mach| {
            if let Some(pool) = weak.upgrade() {
                pool.free_mach(mach);
            }
        })
    }

    /// Stops the machine in the background and returns it to the free queue,
    /// or discards it if the stop fails. Callers never wait for the stop.
    pub(crate) fn free_mach(&self, mach: Arc<Mach>) {
        if self.state.lock().is_shutdown {
            return;
        }
        info!(app = %self.app_name, name = %mach.name(), id = %mach.id(), "pool: free");

        let Some(pool) = self.weak.upgrade() else {
            return;
        };
        self.free_tasks.spawn(async move {
            match mach.stop().await {
                Ok(()) => {
                    let _ = pool.free_tx.send(mach).await;
                }
                Err(err) => {
                    warn!(name = %mach.name(), id = %mach.id(), error = %err, "pool: free: stop failed");
                    pool.discard_mach(&mach, "stop machine failed");
                }
            }
        });
    }

    /// Removes the machine from the pool and queues it for destruction.
    pub(crate) fn discard_mach(&self, mach: &Arc<Mach>, reason: &str) {
        info!(name = %mach.name(), id = %mach.id(), reason, "pool: discard machine");

        self.state.lock().machs.remove(mach.name());

        if self.discard_tx.try_send(mach.clone()).is_err() {
            // Bounded at capacity; full means the pool invariant broke.
            warn!(name = %mach.name(), "pool: discard queue full, dropping");
        }
    }

    /// Adds a stopped machine that is not yet in the pool, if there is room.
    fn add_free_mach(&self, mach: Arc<Mach>) -> bool {
        let name = mach.name().to_string();
        let mut state = self.state.lock();
        if state.machs.len() >= self.capacity {
            return false;
        }
        state.machs.insert(name.clone(), mach.clone());
        if self.free_tx.try_send(mach).is_err() {
            state.machs.remove(&name);
            return false;
        }
        true
    }

    /// Destroys discarded machines one at a time, best effort. Failures are
    /// caught later by this or another pool's cleaner.
    async fn handle_discards(self: Arc<Self>, mut rx: mpsc::Receiver<Arc<Mach>>) {
        debug!("pool: discard handler started");
        loop {
            let mach = tokio::select! {
                _ = self.cancel.cancelled() => break,
                recv = rx.recv() => match recv {
                    Some(mach) => mach,
                    None => break,
                },
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = mach.destroy() => {
                    if let Err(err) = result {
                        warn!(name = %mach.name(), error = %err, "pool: discard: destroy failed");
                    }
                }
            }

            // Stagger destruction when several machines queue up at once.
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(DISCARD_STAGGER) => {}
            }
        }
        debug!("pool: discard handler exiting");
    }

    async fn get_lease(&self, mach_id: &str) -> Result<LeaseData, PoolError> {
        let lease = self
            .api
            .get_lease(&self.app_name, mach_id, ReqOpts::new())
            .await?;
        if lease.status != "success" {
            return Err(PoolError::LeaseStatus(lease.status));
        }
        Ok(lease.data)
    }

    /// Cleanup pass over one listed machine. Destroys machines without an
    /// active lease, adopts machines this pool owned before a restart, and
    /// returns how many machines were adopted.
    async fn clean_mach(&self, m: &MachineResp) -> usize {
        let pool_mach = self.state.lock().machs.get(&m.name).cloned();
        let ours = m.config.metadata.get(META_POOL_KEY) == Some(&self.metadata)
            && parse_worker_name(&m.name) == Some(self.name.as_str());

        // An unparseable creation time counts as ancient.
        let created_at = DateTime::parse_from_rfc3339(&m.created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let age = Utc::now() - created_at;
        let probably_expired = age > self.lease_time;

        debug!(
            name = %m.name,
            id = %m.id,
            age_secs = age.num_seconds(),
            ours,
            inpool = pool_mach.is_some(),
            "pool: clean: examining"
        );

        if let Some(pool_mach) = pool_mach {
            if !pool_mach.lease_sufficient(TimeDelta::zero()) {
                // Destroy it but leave it in the pool and free queue; the
                // next allocator to pick it up discards it.
                info!(name = %m.name, id = %m.id, "pool: clean: destroying expired pool machine");
                let _ = pool_mach.destroy().await;
            }
            return 0;
        }

        if !ours {
            if probably_expired {
                // Without the nonce this only succeeds if nobody holds a
                // valid lease, which is the desired outcome.
                info!(name = %m.name, id = %m.id, "pool: clean: destroying, not ours");
                let _ = self.api.destroy(&self.app_name, &m.id, true, ReqOpts::new()).await;
            }
            return 0;
        }

        // Ours but not in the pool: an orphan from a previous life.
        let lease = match self.get_lease(&m.id).await {
            Ok(lease) => lease,
            Err(err) => {
                info!(name = %m.name, id = %m.id, error = %err, "pool: clean: destroying, no usable lease");
                let _ = self.api.destroy(&self.app_name, &m.id, true, ReqOpts::new()).await;
                return 0;
            }
        };

        let lease_expires = Utc
            .timestamp_opt(lease.expires_at, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let Some(pool) = self.weak.upgrade() else {
            return 0;
        };
        let mach = Mach::from_listing(&pool, m, lease.nonce, lease_expires);

        let adopted: Result<(), String> = async {
            if !mach.lease_sufficient(self.worker_time) {
                return Err("lease expiring too soon".to_string());
            }
            mach.stop().await.map_err(|err| err.to_string())?;
            if !self.add_free_mach(mach.clone()) {
                return Err("pool already at capacity".to_string());
            }
            Ok(())
        }
        .await;

        match adopted {
            Ok(()) => {
                info!(name = %m.name, id = %m.id, "pool: clean: adopted");
                1
            }
            Err(reason) => {
                info!(name = %m.name, id = %m.id, reason, "pool: clean: destroying");
                let _ = mach.destroy().await;
                0
            }
        }
    }

    fn show_stats(&self) {
        debug!(
            alloc = ?self.stats.alloc.stats(),
            create = ?self.stats.create.stats(),
            start = ?self.stats.start.stats(),
            stop = ?self.stats.stop.stats(),
            destroy = ?self.stats.destroy.stats(),
            lease = ?self.stats.lease.stats(),
            "pool: stats"
        );
    }

    async fn clean_cycle(&self) {
        let opts = if self.region.is_empty() {
            ReqOpts::new()
        } else {
            ReqOpts::new().query("region", &self.region)
        };
        match self.api.list(&self.app_name, opts).await {
            Ok(machines) => {
                let mut adopted = 0;
                for m in &machines {
                    adopted += self.clean_mach(m).await;
                }
                info!(adopted, "pool: clean: cycle complete");
            }
            Err(err) => warn!(error = %err, "pool: clean: list failed"),
        }
    }

    async fn run_cleaner(self: Arc<Self>) {
        debug!("pool: clean: starting");
        loop {
            self.show_stats();

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.clean_cycle() => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(CLEANER_DELAY) => {}
            }
        }
        debug!("pool: clean: exiting");
    }

    /// Stops the pool's machinery without touching the machines. In-flight
    /// background stops are awaited before teardown so none of them race the
    /// shutdown.
    async fn shutdown(&self) {
        info!("pool: shutdown");

        self.free_tasks.close();
        self.free_tasks.wait().await;

        {
            let mut state = self.state.lock();
            if state.is_shutdown {
                return;
            }
            state.is_shutdown = true;
        }

        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.bg_tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Shuts down and stops every machine, accumulating errors but always
    /// trying each machine.
    pub async fn close(&self) -> Result<(), PoolError> {
        self.shutdown().await;

        let machs: Vec<Arc<Mach>> = self.state.lock().machs.values().cloned().collect();
        let mut failures = Vec::new();
        for mach in machs {
            if let Err(err) = mach.stop().await {
                failures.push(format!("{}: {err}", mach.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Cleanup(failures.join("; ")))
        }
    }

    /// Shuts down and destroys every machine, accumulating errors but always
    /// trying each machine.
    pub async fn destroy(&self) -> Result<(), PoolError> {
        self.shutdown().await;

        let machs: Vec<Arc<Mach>> = {
            let mut state = self.state.lock();
            let machs = state.machs.values().cloned().collect();
            state.machs.clear();
            machs
        };
        let mut failures = Vec::new();
        for mach in machs {
            if let Err(err) = mach.destroy().await {
                failures.push(format!("{}: {err}", mach.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Cleanup(failures.join("; ")))
        }
    }
}

#[async_trait::async_trait]
impl WorkerPool for FlyPool {
    async fn alloc(&self, wait_for_free: bool) -> Result<Option<Worker>, PoolError> {
        FlyPool::alloc(self, wait_for_free).await
    }

    async fn close(&self) -> Result<(), PoolError> {
        FlyPool::close(self).await
    }

    async fn destroy(&self) -> Result<(), PoolError> {
        FlyPool::destroy(self).await
    }
}
