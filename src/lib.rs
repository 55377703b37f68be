//! Purpose: Shared-memory key/value pools for cooperating local processes.
//! Exports: `api` (manager, handles, options, errors) and `core` (storage internals).
//! Role: Library backing the `latzero` CLI and the integration tests.
//! Invariants: All cross-process state lives under one base directory; see `pool_paths`.
//! Invariants: `api` is the supported surface; `core` may change between releases.
pub mod api;
pub mod core;
pub mod pool_paths;
