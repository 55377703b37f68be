// Creation, connection, and registry-table settings.
use std::time::Duration;

use zeroize::Zeroizing;

use crate::core::crypto::{DEFAULT_KDF_ROUNDS, MIN_KDF_ROUNDS};
use crate::core::error::{Error, ErrorKind};
use crate::core::segment::{DEFAULT_SEGMENT_SIZE, SEGMENT_HEADER_LEN};

pub const MAX_POOL_NAME_LEN: usize = 64;

pub const DEFAULT_MAX_CAPACITY: u64 = 64 * 1024 * 1024;
pub const DEFAULT_IDLE_DESTROY: Duration = Duration::from_secs(60);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub require_auth: bool,
    pub encrypted: bool,
    pub credential: Option<Zeroizing<Vec<u8>>>,
    pub initial_capacity: u64,
    pub max_capacity: u64,
    pub segment_size: u64,
    pub idle_destroy: Duration,
    pub default_ttl: Option<Duration>,
    /// PBKDF2 rounds applied to the credential; stored with the pool.
    pub kdf_rounds: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            require_auth: false,
            encrypted: false,
            credential: None,
            initial_capacity: DEFAULT_SEGMENT_SIZE,
            max_capacity: DEFAULT_MAX_CAPACITY,
            segment_size: DEFAULT_SEGMENT_SIZE,
            idle_destroy: DEFAULT_IDLE_DESTROY,
            default_ttl: None,
            kdf_rounds: DEFAULT_KDF_ROUNDS,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credential(mut self, credential: impl AsRef<[u8]>) -> Self {
        self.credential = Some(Zeroizing::new(credential.as_ref().to_vec()));
        self
    }

    pub fn require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn initial_capacity(mut self, bytes: u64) -> Self {
        self.initial_capacity = bytes;
        self
    }

    pub fn max_capacity(mut self, bytes: u64) -> Self {
        self.max_capacity = bytes;
        self
    }

    pub fn segment_size(mut self, bytes: u64) -> Self {
        self.segment_size = bytes;
        self
    }

    pub fn idle_destroy(mut self, timeout: Duration) -> Self {
        self.idle_destroy = timeout;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn kdf_rounds(mut self, rounds: u32) -> Self {
        self.kdf_rounds = rounds;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if (self.require_auth || self.encrypted) && self.credential.is_none() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("require_auth and encrypted pools need a credential"));
        }
        if self.segment_size < 2 * SEGMENT_HEADER_LEN as u64 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("segment size must be at least 256 bytes"));
        }
        if self.initial_capacity > self.max_capacity {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("initial capacity exceeds max capacity"));
        }
        if self.kdf_rounds < MIN_KDF_ROUNDS {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("kdf rounds must be at least {MIN_KDF_ROUNDS}")));
        }
        if self.default_ttl == Some(Duration::ZERO) {
            return Err(Error::new(ErrorKind::Usage).with_message("default ttl must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub credential: Option<Zeroizing<Vec<u8>>>,
    pub readonly: bool,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credential(mut self, credential: impl AsRef<[u8]>) -> Self {
        self.credential = Some(Zeroizing::new(credential.as_ref().to_vec()));
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

/// Table sizes apply only when the registry file is first created; an
/// existing registry keeps the sizes recorded in its header.
#[derive(Clone, Copy, Debug)]
pub struct RegistryOptions {
    pub pool_slots: u32,
    pub client_slots: u32,
    pub lock_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            pool_slots: 64,
            client_slots: 512,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Pool names become directory names, so they are restricted to a portable
/// character set.
pub fn validate_pool_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_POOL_NAME_LEN {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("pool name must be 1..={MAX_POOL_NAME_LEN} bytes"))
            .with_pool(name));
    }
    let valid = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if !valid || name.starts_with('.') {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("pool name may contain only [A-Za-z0-9_.-] and must not start with '.'")
            .with_pool(name));
    }
    Ok(())
}
