//! Purpose: Define the public Rust API boundary for latzero.
//! Exports: Manager, handles, options, value types, and errors.
//! Role: Additive-only surface used by the CLI and embedders.
//! Invariants: Storage layout types (segments, entry records) are not re-exported here.

mod client;

pub use crate::core::codec::{Codec, TypeTag, Value};
pub use crate::core::crypto::{DEFAULT_KDF_ROUNDS, MIN_KDF_ROUNDS};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::events::MAX_TOPIC_LEN;
pub use crate::core::options::{ConnectOptions, PoolOptions, RegistryOptions};
pub use crate::core::pool::{EntryInfo, Namespace, PoolHandle};
pub use crate::core::reclaim::{
    CycleReport, DaemonHandle, LivenessProbe, ProcessProbe, ReclaimConfig, ReclaimDaemon,
};
pub use crate::core::registry::{GlobalStats, PoolInfo, PoolStats};
pub use crate::core::snapshot::{restore_snapshot, write_snapshot};
pub use crate::core::store::MemoryUsage;
pub use client::{ApiResult, PoolManager};
