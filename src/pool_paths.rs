//! Purpose: Resolve the base directory that holds the registry and pool storage.
//! Exports: `default_base_dir`, `BASE_DIR_ENV`.
//! Role: Keep CLI and library defaults aligned from one source.
//! Invariants: `LATZERO_DIR` wins; otherwise tmpfs (`/dev/shm`) is preferred over the temp dir.

use std::path::{Path, PathBuf};

pub const BASE_DIR_ENV: &str = "LATZERO_DIR";

pub fn default_base_dir() -> PathBuf {
    base_dir_from(std::env::var_os(BASE_DIR_ENV).map(PathBuf::from), Path::new("/dev/shm"))
}

fn base_dir_from(explicit: Option<PathBuf>, shm: &Path) -> PathBuf {
    if let Some(dir) = explicit.filter(|dir| !dir.as_os_str().is_empty()) {
        return dir;
    }
    if shm.is_dir() {
        return shm.join("latzero");
    }
    std::env::temp_dir().join("latzero")
}
