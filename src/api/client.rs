//! Purpose: Entry point for creating, connecting to, and administering pools.
//! Exports: `PoolManager`, `ApiResult`.
//! Role: Stable boundary for the CLI and embedders; owns one registry mapping.
//! Invariants: Every manager operation re-reads registry state; nothing is cached across calls.
//! Invariants: Handles returned by `connect` keep the registry alive through an `Arc`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::codec::Codec;
use crate::core::error::Error;
use crate::core::options::{ConnectOptions, PoolOptions, RegistryOptions};
use crate::core::pool::PoolHandle;
use crate::core::reclaim::{CycleReport, ReclaimConfig, ReclaimDaemon};
use crate::core::registry::{GlobalStats, PoolInfo, PoolStats, Registry};
use crate::pool_paths::default_base_dir;

pub type ApiResult<T> = Result<T, Error>;

#[derive(Clone, Debug)]
pub struct PoolManager {
    registry: Arc<Registry>,
    codec: Codec,
}

impl PoolManager {
    /// Opens the registry in the default base directory.
    pub fn new() -> ApiResult<Self> {
        Self::with_dir(default_base_dir())
    }

    pub fn with_dir(base_dir: impl Into<PathBuf>) -> ApiResult<Self> {
        Self::with_options(base_dir, RegistryOptions::default())
    }

    pub fn with_options(base_dir: impl Into<PathBuf>, options: RegistryOptions) -> ApiResult<Self> {
        let registry = Registry::open(base_dir.into(), options)?;
        Ok(Self {
            registry: Arc::new(registry),
            codec: Codec::default(),
        })
    }

    /// Codec used by handles opened from this manager afterwards.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn base_dir(&self) -> &Path {
        self.registry.base()
    }

    pub fn create(&self, name: &str, options: PoolOptions) -> ApiResult<PoolInfo> {
        self.registry.create(name, &options)
    }

    pub fn connect(&self, name: &str) -> ApiResult<PoolHandle> {
        self.connect_with(name, &ConnectOptions::default())
    }

    pub fn connect_with(&self, name: &str, options: &ConnectOptions) -> ApiResult<PoolHandle> {
        let credential = options.credential.as_ref().map(|credential| credential.as_slice());
        let binding = self.registry.bind(name, credential, options.readonly)?;
        PoolHandle::attach(Arc::clone(&self.registry), binding, self.codec)
    }

    /// Same as `handle.disconnect()`.
    pub fn disconnect(&self, handle: PoolHandle) -> ApiResult<()> {
        handle.disconnect()
    }

    pub fn destroy(&self, name: &str) -> ApiResult<()> {
        self.registry.destroy(name)
    }

    pub fn stats(&self, name: &str) -> ApiResult<PoolStats> {
        self.registry.stats(name)
    }

    pub fn lookup(&self, name: &str) -> ApiResult<Option<PoolInfo>> {
        self.registry.lookup(name)
    }

    pub fn exists(&self, name: &str) -> ApiResult<bool> {
        self.registry.exists(name)
    }

    pub fn list_pools(&self) -> ApiResult<Vec<PoolInfo>> {
        self.registry.list()
    }

    pub fn global_stats(&self) -> ApiResult<GlobalStats> {
        self.registry.global_stats()
    }

    pub fn set_max_capacity(&self, name: &str, max_capacity: u64) -> ApiResult<()> {
        self.registry.set_max_capacity(name, max_capacity)
    }

    pub fn reclaim_daemon(&self, config: ReclaimConfig) -> ReclaimDaemon {
        ReclaimDaemon::new(Arc::clone(&self.registry), config)
    }

    /// One reclaim pass with default liveness settings.
    pub fn reclaim_now(&self) -> ApiResult<CycleReport> {
        self.reclaim_daemon(ReclaimConfig::default()).run_cycle()
    }
}
