use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    PoolNotFound,
    PoolAlreadyExists,
    AuthFailure,
    IntegrityFailure,
    CapacityExceeded,
    LockTimeout,
    Serialization,
    CorruptedRecord,
    ReadOnly,
    Disconnected,
    RegistryFull,
    Timeout,
    HandlerFailed,
    Usage,
    Io,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    pool: Option<String>,
    key: Option<String>,
    path: Option<PathBuf>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            pool: None,
            key: None,
            path: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    /// Only lock contention is worth retrying; every other kind is a stable outcome.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::LockTimeout
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    /// Attaches a pool name unless one is already recorded.
    pub fn or_pool(mut self, pool: &str) -> Self {
        if self.pool.is_none() {
            self.pool = Some(pool.to_string());
        }
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn or_key(mut self, key: &str) -> Self {
        if self.key.is_none() {
            self.key = Some(key.to_string());
        }
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(pool) = &self.pool {
            write!(f, " (pool: {pool})")?;
        }
        if let Some(key) = &self.key {
            write!(f, " (key: {key})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn io_error(err: std::io::Error, path: impl Into<PathBuf>) -> Error {
    Error::new(ErrorKind::Io).with_path(path).with_source(err)
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::PoolNotFound => 3,
        ErrorKind::PoolAlreadyExists => 4,
        ErrorKind::LockTimeout => 5,
        ErrorKind::AuthFailure => 6,
        ErrorKind::CorruptedRecord => 7,
        ErrorKind::Io => 8,
        ErrorKind::IntegrityFailure => 9,
        ErrorKind::CapacityExceeded => 10,
        ErrorKind::Serialization => 11,
        ErrorKind::ReadOnly => 12,
        ErrorKind::Disconnected => 13,
        ErrorKind::RegistryFull => 14,
        ErrorKind::Timeout => 15,
        ErrorKind::HandlerFailed => 16,
    }
}
