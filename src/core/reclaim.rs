//! Purpose: Background maintenance over every pool in a registry.
//! Exports: `ReclaimDaemon`, `ReclaimConfig`, `CycleReport`, `LivenessProbe`, `ProcessProbe`.
//! Role: Expires entries, reaps dead clients, and destroys idle pools.
//! Invariants: Each cycle re-reads the registry; no pool is assumed to survive between cycles.
//! Invariants: The daemon thread stops when its `DaemonHandle` is shut down or dropped.
//! Invariants: A client is never judged stale sooner than `MIN_LIVENESS_TIMEOUT`.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::now_ms;
use crate::core::lock::{LockFile, LockMode};
use crate::core::pool::HEARTBEAT_INTERVAL;
use crate::core::registry::Registry;
use crate::core::segment::{LOCK_FILE, SegmentChain};
use crate::core::store::EntryStore;
use crate::core::ticker::Ticker;

/// Handles beat every `HEARTBEAT_INTERVAL`; a shorter liveness timeout would
/// reap clients that are merely between beats.
pub const MIN_LIVENESS_TIMEOUT: Duration =
    Duration::from_millis(HEARTBEAT_INTERVAL.as_millis() as u64 * 3);

/// Decides whether the process that registered a client still exists.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Signal-0 probe: a pid is alive unless `kill` reports `ESRCH`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
}

/// `liveness_timeout` is raised to `MIN_LIVENESS_TIMEOUT` when set lower.
#[derive(Clone, Copy, Debug)]
pub struct ReclaimConfig {
    pub period: Duration,
    pub liveness_timeout: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct CycleReport {
    pub expired_entries: usize,
    pub reaped_clients: usize,
    pub destroyed_pools: usize,
}

pub struct ReclaimDaemon {
    registry: Arc<Registry>,
    config: ReclaimConfig,
    probe: Box<dyn LivenessProbe>,
}

impl ReclaimDaemon {
    pub fn new(registry: Arc<Registry>, config: ReclaimConfig) -> Self {
        Self {
            registry,
            config,
            probe: Box::new(ProcessProbe),
        }
    }

    pub fn with_probe(mut self, probe: impl LivenessProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn config(&self) -> ReclaimConfig {
        self.config
    }

    fn liveness_timeout(&self) -> Duration {
        self.config.liveness_timeout.max(MIN_LIVENESS_TIMEOUT)
    }

    /// Runs one full pass: TTL purge, client reaping, then idle destruction.
    /// A failure on one pool is logged and does not stop the others.
    pub fn run_cycle(&self) -> Result<CycleReport, Error> {
        let mut report = CycleReport::default();
        let now = now_ms();

        for pool in self.registry.list()? {
            match purge_pool(&pool.dir, now, self.registry.lock_timeout()) {
                Ok((expired, capacity, segments)) => {
                    report.expired_entries += expired;
                    if capacity != pool.capacity {
                        if let Err(err) =
                            self.registry.record_usage(&pool.name, &pool.dir, capacity, segments)
                        {
                            warn!(pool = %pool.name, error = %err, "capacity refresh failed");
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::PoolNotFound => {
                    debug!(pool = %pool.name, "pool vanished during cycle");
                }
                Err(err) => warn!(pool = %pool.name, error = %err, "expiry pass failed"),
            }
        }

        report.reaped_clients =
            self.registry
                .reap_clients(now_ms(), self.liveness_timeout(), self.probe.as_ref())?;
        report.destroyed_pools = self.registry.destroy_idle(now_ms())?.len();

        if report != CycleReport::default() {
            info!(
                expired = report.expired_entries,
                reaped = report.reaped_clients,
                destroyed = report.destroyed_pools,
                "reclaim cycle"
            );
        }
        Ok(report)
    }

    /// Moves the daemon onto its own thread, cycling every `period` until the
    /// returned handle is shut down.
    pub fn spawn(self) -> Result<DaemonHandle, Error> {
        let period = self.config.period;
        let ticker = Ticker::spawn("latzero-reclaim", period, move || {
            if let Err(err) = self.run_cycle() {
                warn!(error = %err, "reclaim cycle failed");
            }
            ControlFlow::Continue(())
        })?;
        Ok(DaemonHandle { ticker })
    }
}

/// Owns the daemon thread. Dropping it stops the thread and waits for the
/// in-flight cycle.
#[derive(Debug)]
pub struct DaemonHandle {
    ticker: Ticker,
}

impl DaemonHandle {
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.ticker.stop()?;
        debug!("reclaim daemon stopped");
        Ok(())
    }
}

/// Purges expired entries from the pool stored in `dir`; returns the count
/// plus the chain's capacity and segment count.
fn purge_pool(dir: &Path, now: u64, timeout: Duration) -> Result<(usize, u64, usize), Error> {
    let lock = LockFile::open_existing(dir.join(LOCK_FILE))?;
    let _guard = lock.lock(LockMode::Exclusive, timeout)?;
    let chain = SegmentChain::open(dir)?;
    if chain.is_retired() {
        return Err(Error::new(ErrorKind::PoolNotFound));
    }
    let mut store = EntryStore::new(chain);
    store.sync(true)?;
    let expired = store.purge_expired(now)?;
    if expired > 0 {
        store.chain().flush()?;
    }
    let usage = store.usage();
    Ok((expired, usage.capacity_bytes, usage.segment_count))
}

#[cfg(test)]
mod tests {
    use super::{LivenessProbe, ProcessProbe, ReclaimConfig, ReclaimDaemon};
    use crate::core::segment::segment_path;
    use crate::core::options::{PoolOptions, RegistryOptions};
    use crate::core::registry::Registry;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn own_process_is_alive() {
        assert!(ProcessProbe.is_alive(std::process::id()));
        assert!(!ProcessProbe.is_alive(0));
    }

    #[test]
    fn cycle_destroys_idle_pool_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path(), RegistryOptions::default()).expect("registry"));
        let options = PoolOptions::new()
            .initial_capacity(4096)
            .segment_size(4096)
            .idle_destroy(Duration::ZERO);
        registry.create("idle", &options).expect("create");
        registry.create("busy", &options).expect("create");
        let _binding = registry.bind("busy", None, false).expect("bind");

        let daemon = ReclaimDaemon::new(registry.clone(), ReclaimConfig::default());
        let report = daemon.run_cycle().expect("cycle");
        assert_eq!(report.destroyed_pools, 1);
        assert_eq!(report.reaped_clients, 0);
        assert!(!registry.exists("idle").expect("exists"));
        assert!(registry.exists("busy").expect("exists"));
    }

    #[test]
    fn short_liveness_timeout_does_not_reap_between_beats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path(), RegistryOptions::default()).expect("registry"));
        let options = PoolOptions::new()
            .initial_capacity(4096)
            .segment_size(4096)
            .idle_destroy(Duration::ZERO);
        registry.create("quiet", &options).expect("create");
        let _binding = registry.bind("quiet", None, false).expect("bind");
        std::thread::sleep(Duration::from_millis(30));

        let daemon = ReclaimDaemon::new(
            registry.clone(),
            ReclaimConfig {
                period: Duration::from_secs(1),
                liveness_timeout: Duration::from_millis(1),
            },
        );
        let report = daemon.run_cycle().expect("cycle");
        assert_eq!(report.reaped_clients, 0);
        assert_eq!(report.destroyed_pools, 0);
        assert!(registry.exists("quiet").expect("exists"));
    }

    #[test]
    fn one_broken_pool_does_not_stop_the_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path(), RegistryOptions::default()).expect("registry"));
        let options = PoolOptions::new()
            .initial_capacity(4096)
            .segment_size(4096)
            .idle_destroy(Duration::ZERO);
        let broken = registry.create("broken", &options).expect("create");
        registry.create("idle", &options).expect("create");
        std::fs::remove_file(segment_path(&broken.dir, 0)).expect("remove segment");

        struct Gone;
        impl LivenessProbe for Gone {
            fn is_alive(&self, _pid: u32) -> bool {
                false
            }
        }
        registry.create("orphaned", &options.clone().idle_destroy(Duration::from_secs(3600))).expect("create");
        let _binding = registry.bind("orphaned", None, false).expect("bind");

        let daemon = ReclaimDaemon::new(registry.clone(), ReclaimConfig::default()).with_probe(Gone);
        let report = daemon.run_cycle().expect("cycle survives a broken pool");
        assert_eq!(report.reaped_clients, 1);
        assert!(report.destroyed_pools >= 1);
        assert!(!registry.exists("idle").expect("exists"));
        assert!(registry.exists("orphaned").expect("exists"));
    }

    #[test]
    fn spawned_daemon_stops_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path(), RegistryOptions::default()).expect("registry"));
        let handle = ReclaimDaemon::new(
            registry,
            ReclaimConfig {
                period: Duration::from_millis(10),
                liveness_timeout: Duration::from_secs(60),
            },
        )
        .spawn()
        .expect("spawn");
        std::thread::sleep(Duration::from_millis(30));
        handle.shutdown().expect("shutdown");
    }
}
