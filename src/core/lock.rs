// Bounded-wait advisory file locks used for the registry and per-pool locks.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::core::error::{Error, ErrorKind, io_error};

const MIN_BACKOFF: Duration = Duration::from_micros(200);
const MAX_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Releases the advisory lock on drop.
pub struct FileLockGuard<'a> {
    file: &'a File,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.file);
    }
}

/// A lock file opened once and locked many times; each pool directory has one.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(err, &path))?;
        Ok(Self { file, path })
    }

    /// Opens an existing lock file; a missing file means the pool is gone.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    Error::new(ErrorKind::PoolNotFound)
                        .with_message("pool lock file missing")
                        .with_path(&path)
                } else {
                    io_error(err, &path)
                }
            })?;
        Ok(Self { file, path })
    }

    pub fn lock(&self, mode: LockMode, timeout: Duration) -> Result<FileLockGuard<'_>, Error> {
        lock_with_timeout(&self.file, &self.path, mode, timeout)
    }
}

/// Polls `try_lock_*` until it succeeds or `timeout` elapses.
pub fn lock_with_timeout<'a>(
    file: &'a File,
    path: &Path,
    mode: LockMode,
    timeout: Duration,
) -> Result<FileLockGuard<'a>, Error> {
    let deadline = Instant::now() + timeout;
    let mut backoff = MIN_BACKOFF;
    loop {
        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        };
        match attempt {
            Ok(()) => return Ok(FileLockGuard { file }),
            Err(err) => match lock_error_kind(&err) {
                ErrorKind::LockTimeout => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::new(ErrorKind::LockTimeout)
                            .with_message(format!("lock not acquired within {timeout:?}"))
                            .with_path(path));
                    }
                    std::thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                kind => return Err(Error::new(kind).with_path(path).with_source(err)),
            },
        }
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    if err.kind() == fs2::lock_contended_error().kind() {
        return ErrorKind::LockTimeout;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::LockTimeout,
        _ => ErrorKind::Io,
    }
}
