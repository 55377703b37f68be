//! Purpose: The process-shared table of pools and client bindings.
//! Exports: `Registry`, `PoolInfo`, `PoolStats`, `GlobalStats`, `ClientBinding`.
//! Role: Single source of truth for discovery, authentication, and lifetime.
//! Invariants: Every table access holds the registry file lock (and the local mutex).
//! Invariants: Lock order is registry before pool; pool locks never call back in here.
//! Invariants: Only the salt, KDF round count, and a derived verifier are stored; never a key or credential.
//! Invariants: Credential stretching runs outside the registry lock.
//!
//! Layout is a 64-byte header followed by fixed-width pool records (256 bytes)
//! and client records (64 bytes). A record with a bad name is skipped, not
//! treated as a fatal registry error.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::MmapMut;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::crypto::{
    PoolKey, SALT_SIZE, VERIFIER_SIZE, constant_time_eq, random_bytes, stretch,
};
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::layout::{now_ms, read_u32, read_u64, write_u32, write_u64};
use crate::core::lock::{LockFile, LockMode, lock_with_timeout};
use crate::core::options::{MAX_POOL_NAME_LEN, PoolOptions, RegistryOptions, validate_pool_name};
use crate::core::reclaim::LivenessProbe;
use crate::core::segment::{LOCK_FILE, SegmentChain, release_dir};
use crate::core::store::EntryStore;

pub const REGISTRY_FILE: &str = "registry.lzr";
pub const POOLS_DIR: &str = "pools";

const MAGIC: [u8; 4] = *b"LZRG";
const VERSION: u32 = 2;
const HEADER_LEN: usize = 64;
const POOL_RECORD_LEN: usize = 256;
const CLIENT_RECORD_LEN: usize = 64;

const HDR_POOL_SLOTS: usize = 8;
const HDR_CLIENT_SLOTS: usize = 12;
const HDR_GENERATION: usize = 16;
const HDR_NEXT_CLIENT_ID: usize = 24;

pub const POOL_IN_USE: u32 = 0x1;
pub const POOL_AUTH: u32 = 0x2;
pub const POOL_ENCRYPTED: u32 = 0x4;

const CLIENT_IN_USE: u32 = 0x1;
const CLIENT_READONLY: u32 = 0x2;

#[derive(Clone, Debug, Eq, PartialEq)]
struct PoolRecord {
    name: String,
    flags: u32,
    client_count: u32,
    token: u64,
    created_ms: u64,
    last_heartbeat_ms: u64,
    idle_since_ms: u64,
    idle_destroy_ms: u64,
    default_ttl_ms: u64,
    capacity: u64,
    max_capacity: u64,
    segment_size: u64,
    segment_count: u32,
    salt: [u8; SALT_SIZE],
    verifier: [u8; VERIFIER_SIZE],
    kdf_rounds: u32,
}

impl PoolRecord {
    fn encode(&self) -> [u8; POOL_RECORD_LEN] {
        let mut buf = [0u8; POOL_RECORD_LEN];
        buf[..self.name.len()].copy_from_slice(self.name.as_bytes());
        write_u32(&mut buf, 64, self.flags);
        write_u32(&mut buf, 68, self.client_count);
        write_u64(&mut buf, 72, self.token);
        write_u64(&mut buf, 80, self.created_ms);
        write_u64(&mut buf, 88, self.last_heartbeat_ms);
        write_u64(&mut buf, 96, self.idle_since_ms);
        write_u64(&mut buf, 104, self.idle_destroy_ms);
        write_u64(&mut buf, 112, self.default_ttl_ms);
        write_u64(&mut buf, 120, self.capacity);
        write_u64(&mut buf, 128, self.max_capacity);
        write_u64(&mut buf, 136, self.segment_size);
        write_u32(&mut buf, 144, self.segment_count);
        buf[152..152 + SALT_SIZE].copy_from_slice(&self.salt);
        buf[168..168 + VERIFIER_SIZE].copy_from_slice(&self.verifier);
        write_u32(&mut buf, 200, self.kdf_rounds);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        let raw_name = &buf[..MAX_POOL_NAME_LEN];
        let name_len = raw_name.iter().position(|b| *b == 0).unwrap_or(MAX_POOL_NAME_LEN);
        let name = std::str::from_utf8(&raw_name[..name_len])
            .map_err(|_| corrupt("pool name is not utf-8"))?
            .to_string();
        validate_pool_name(&name).map_err(|_| corrupt("pool name is malformed"))?;
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&buf[152..152 + SALT_SIZE]);
        let mut verifier = [0u8; VERIFIER_SIZE];
        verifier.copy_from_slice(&buf[168..168 + VERIFIER_SIZE]);
        Ok(Self {
            name,
            flags: read_u32(buf, 64),
            client_count: read_u32(buf, 68),
            token: read_u64(buf, 72),
            created_ms: read_u64(buf, 80),
            last_heartbeat_ms: read_u64(buf, 88),
            idle_since_ms: read_u64(buf, 96),
            idle_destroy_ms: read_u64(buf, 104),
            default_ttl_ms: read_u64(buf, 112),
            capacity: read_u64(buf, 120),
            max_capacity: read_u64(buf, 128),
            segment_size: read_u64(buf, 136),
            segment_count: read_u32(buf, 144),
            salt,
            verifier,
            kdf_rounds: read_u32(buf, 200),
        })
    }

    fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    fn dir(&self, base: &Path) -> PathBuf {
        pool_dir(base, &self.name, self.token)
    }

    fn is_protected(&self) -> bool {
        self.has(POOL_AUTH) || self.has(POOL_ENCRYPTED)
    }

    fn release_client(&mut self, now: u64) {
        self.client_count = self.client_count.saturating_sub(1);
        if self.client_count == 0 {
            self.idle_since_ms = now;
        }
    }

    fn info(&self, base: &Path) -> PoolInfo {
        PoolInfo {
            name: self.name.clone(),
            require_auth: self.has(POOL_AUTH),
            encrypted: self.has(POOL_ENCRYPTED),
            client_count: self.client_count,
            created_ms: self.created_ms,
            last_heartbeat_ms: self.last_heartbeat_ms,
            idle_since_ms: (self.client_count == 0).then_some(self.idle_since_ms),
            idle_destroy_ms: self.idle_destroy_ms,
            default_ttl_ms: (self.default_ttl_ms != 0).then_some(self.default_ttl_ms),
            capacity: self.capacity,
            max_capacity: self.max_capacity,
            segment_size: self.segment_size,
            segment_count: self.segment_count,
            kdf_rounds: self.is_protected().then_some(self.kdf_rounds),
            dir: self.dir(base),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ClientRecord {
    flags: u32,
    pool_slot: u32,
    pool_token: u64,
    client_id: u64,
    pid: u32,
    connected_ms: u64,
    last_heartbeat_ms: u64,
    heartbeats: u64,
}

impl ClientRecord {
    fn encode(&self) -> [u8; CLIENT_RECORD_LEN] {
        let mut buf = [0u8; CLIENT_RECORD_LEN];
        write_u32(&mut buf, 0, self.flags);
        write_u32(&mut buf, 4, self.pool_slot);
        write_u64(&mut buf, 8, self.pool_token);
        write_u64(&mut buf, 16, self.client_id);
        write_u32(&mut buf, 24, self.pid);
        write_u64(&mut buf, 32, self.connected_ms);
        write_u64(&mut buf, 40, self.last_heartbeat_ms);
        write_u64(&mut buf, 48, self.heartbeats);
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            flags: read_u32(buf, 0),
            pool_slot: read_u32(buf, 4),
            pool_token: read_u64(buf, 8),
            client_id: read_u64(buf, 16),
            pid: read_u32(buf, 24),
            connected_ms: read_u64(buf, 32),
            last_heartbeat_ms: read_u64(buf, 40),
            heartbeats: read_u64(buf, 48),
        }
    }
}

/// Public view of one pool record.
#[derive(Clone, Debug, Serialize)]
pub struct PoolInfo {
    pub name: String,
    pub require_auth: bool,
    pub encrypted: bool,
    pub client_count: u32,
    pub created_ms: u64,
    pub last_heartbeat_ms: u64,
    pub idle_since_ms: Option<u64>,
    pub idle_destroy_ms: u64,
    pub default_ttl_ms: Option<u64>,
    pub capacity: u64,
    pub max_capacity: u64,
    pub segment_size: u64,
    pub segment_count: u32,
    /// PBKDF2 rounds for protected pools.
    pub kdf_rounds: Option<u32>,
    pub dir: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    #[serde(flatten)]
    pub info: PoolInfo,
    pub entry_count: usize,
    pub used_bytes: u64,
    pub dead_bytes: u64,
    pub utilization: f64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct GlobalStats {
    pub pool_count: usize,
    pub client_count: u64,
    pub total_capacity: u64,
    pub pool_slots: u32,
    pub client_slots: u32,
}

/// What `bind` hands to a pool handle. Holds the derived key, if any.
#[derive(Debug)]
pub struct ClientBinding {
    pub pool: String,
    pub pool_slot: u32,
    pub pool_token: u64,
    pub client_slot: u32,
    pub client_id: u64,
    pub readonly: bool,
    pub encrypted: bool,
    pub default_ttl_ms: Option<u64>,
    pub dir: PathBuf,
    pub key: Option<PoolKey>,
}

struct Table<'a> {
    buf: &'a mut [u8],
    pool_slots: u32,
    client_slots: u32,
}

impl<'a> Table<'a> {
    fn new(buf: &'a mut [u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN || buf[0..4] != MAGIC {
            return Err(corrupt("bad registry magic"));
        }
        if read_u32(buf, 4) != VERSION {
            return Err(corrupt("unsupported registry version"));
        }
        let pool_slots = read_u32(buf, HDR_POOL_SLOTS);
        let client_slots = read_u32(buf, HDR_CLIENT_SLOTS);
        if buf.len() != registry_len(pool_slots, client_slots) {
            return Err(corrupt("registry size does not match its header"));
        }
        Ok(Self {
            buf,
            pool_slots,
            client_slots,
        })
    }

    fn pool_offset(slot: u32) -> usize {
        HEADER_LEN + slot as usize * POOL_RECORD_LEN
    }

    fn client_offset(&self, slot: u32) -> usize {
        HEADER_LEN + self.pool_slots as usize * POOL_RECORD_LEN + slot as usize * CLIENT_RECORD_LEN
    }

    fn pool(&self, slot: u32) -> Option<PoolRecord> {
        let start = Self::pool_offset(slot);
        let buf = &self.buf[start..start + POOL_RECORD_LEN];
        if read_u32(buf, 64) & POOL_IN_USE == 0 {
            return None;
        }
        match PoolRecord::decode(buf) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(slot, error = %err, "skipping unreadable pool record");
                None
            }
        }
    }

    fn put_pool(&mut self, slot: u32, record: &PoolRecord) {
        let start = Self::pool_offset(slot);
        self.buf[start..start + POOL_RECORD_LEN].copy_from_slice(&record.encode());
    }

    fn clear_pool(&mut self, slot: u32) {
        let start = Self::pool_offset(slot);
        self.buf[start..start + POOL_RECORD_LEN].fill(0);
    }

    fn pools(&self) -> Vec<(u32, PoolRecord)> {
        (0..self.pool_slots)
            .filter_map(|slot| self.pool(slot).map(|record| (slot, record)))
            .collect()
    }

    fn find_pool(&self, name: &str) -> Option<(u32, PoolRecord)> {
        self.pools().into_iter().find(|(_, record)| record.name == name)
    }

    fn free_pool_slot(&self) -> Option<u32> {
        (0..self.pool_slots).find(|slot| {
            let start = Self::pool_offset(*slot);
            read_u32(self.buf, start + 64) & POOL_IN_USE == 0
        })
    }

    fn client(&self, slot: u32) -> Option<ClientRecord> {
        let start = self.client_offset(slot);
        let record = ClientRecord::decode(&self.buf[start..start + CLIENT_RECORD_LEN]);
        (record.flags & CLIENT_IN_USE != 0).then_some(record)
    }

    fn put_client(&mut self, slot: u32, record: &ClientRecord) {
        let start = self.client_offset(slot);
        self.buf[start..start + CLIENT_RECORD_LEN].copy_from_slice(&record.encode());
    }

    fn clear_client(&mut self, slot: u32) {
        let start = self.client_offset(slot);
        self.buf[start..start + CLIENT_RECORD_LEN].fill(0);
    }

    fn clients(&self) -> Vec<(u32, ClientRecord)> {
        (0..self.client_slots)
            .filter_map(|slot| self.client(slot).map(|record| (slot, record)))
            .collect()
    }

    fn free_client_slot(&self) -> Option<u32> {
        (0..self.client_slots).find(|slot| self.client(*slot).is_none())
    }

    fn next_client_id(&mut self) -> u64 {
        let id = read_u64(self.buf, HDR_NEXT_CLIENT_ID) + 1;
        write_u64(self.buf, HDR_NEXT_CLIENT_ID, id);
        id
    }

    fn bump_generation(&mut self) {
        let next = read_u64(self.buf, HDR_GENERATION).wrapping_add(1);
        write_u64(self.buf, HDR_GENERATION, next);
    }

    fn generation(&self) -> u64 {
        read_u64(self.buf, HDR_GENERATION)
    }
}

pub struct Registry {
    base: PathBuf,
    path: PathBuf,
    file: File,
    map: Mutex<MmapMut>,
    lock_timeout: Duration,
}

impl Registry {
    /// Opens the registry under `base`, creating the file on first use.
    pub fn open(base: impl AsRef<Path>, options: RegistryOptions) -> Result<Self, Error> {
        let base = base.as_ref().to_path_buf();
        if options.pool_slots == 0 || options.client_slots == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("registry slot counts must be positive"));
        }
        let pools = base.join(POOLS_DIR);
        fs::create_dir_all(&pools).map_err(|err| io_error(err, &pools))?;

        let path = base.join(REGISTRY_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(err, &path))?;

        let map = {
            let _guard = lock_with_timeout(&file, &path, LockMode::Exclusive, options.lock_timeout)?;
            let len = file.metadata().map_err(|err| io_error(err, &path))?.len();
            let fresh = len == 0;
            if fresh {
                let size = registry_len(options.pool_slots, options.client_slots) as u64;
                file.set_len(size).map_err(|err| io_error(err, &path))?;
            }
            let mut map = unsafe { MmapMut::map_mut(&file).map_err(|err| io_error(err, &path))? };
            if fresh {
                map[0..4].copy_from_slice(&MAGIC);
                write_u32(&mut map, 4, VERSION);
                write_u32(&mut map, HDR_POOL_SLOTS, options.pool_slots);
                write_u32(&mut map, HDR_CLIENT_SLOTS, options.client_slots);
                map.flush().map_err(|err| io_error(err, &path))?;
                debug!(path = %path.display(), "initialized registry");
            }
            Table::new(&mut map).map_err(|err| err.with_path(&path))?;
            map
        };

        Ok(Self {
            base,
            path,
            file,
            map: Mutex::new(map),
            lock_timeout: options.lock_timeout,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn with_table<T>(
        &self,
        mode: LockMode,
        f: impl FnOnce(&mut Table<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut map = self.map.lock();
        let _guard = lock_with_timeout(&self.file, &self.path, mode, self.lock_timeout)?;
        let mut table = Table::new(&mut map).map_err(|err| err.with_path(&self.path))?;
        f(&mut table)
    }

    pub fn create(&self, name: &str, options: &PoolOptions) -> Result<PoolInfo, Error> {
        validate_pool_name(name)?;
        options.validate().map_err(|err| err.with_pool(name))?;
        let salt = random_bytes::<SALT_SIZE>()?;
        let verifier = match &options.credential {
            Some(credential) if options.require_auth || options.encrypted => {
                stretch(credential, &salt, options.kdf_rounds)?.verifier()?
            }
            _ => [0u8; VERIFIER_SIZE],
        };
        self.with_table(LockMode::Exclusive, |table| {
            if table.find_pool(name).is_some() {
                return Err(Error::new(ErrorKind::PoolAlreadyExists).with_pool(name));
            }
            let slot = table.free_pool_slot().ok_or_else(|| {
                Error::new(ErrorKind::RegistryFull)
                    .with_message("no free pool slots")
                    .with_pool(name)
            })?;

            let token = u64::from_le_bytes(random_bytes::<8>()?) | 1;
            let dir = pool_dir(&self.base, name, token);
            release_dir(&dir)?;
            let chain = SegmentChain::allocate_pool(
                &dir,
                options.initial_capacity,
                options.segment_size,
                options.max_capacity,
            )
            .map_err(|err| err.with_pool(name))?;

            let now = now_ms();
            let mut flags = POOL_IN_USE;
            if options.require_auth {
                flags |= POOL_AUTH;
            }
            if options.encrypted {
                flags |= POOL_ENCRYPTED;
            }
            let record = PoolRecord {
                name: name.to_string(),
                flags,
                client_count: 0,
                token,
                created_ms: now,
                last_heartbeat_ms: now,
                idle_since_ms: now,
                idle_destroy_ms: options.idle_destroy.as_millis() as u64,
                default_ttl_ms: options.default_ttl.map_or(0, |ttl| ttl.as_millis().max(1) as u64),
                capacity: chain.capacity(),
                max_capacity: options.max_capacity,
                segment_size: options.segment_size,
                segment_count: chain.segment_count() as u32,
                salt,
                verifier,
                kdf_rounds: options.kdf_rounds,
            };
            table.put_pool(slot, &record);
            table.bump_generation();
            debug!(pool = name, slot, dir = %dir.display(), "created pool");
            Ok(record.info(&self.base))
        })
    }

    pub fn lookup(&self, name: &str) -> Result<Option<PoolInfo>, Error> {
        self.with_table(LockMode::Shared, |table| {
            Ok(table.find_pool(name).map(|(_, record)| record.info(&self.base)))
        })
    }

    pub fn exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.lookup(name)?.is_some())
    }

    pub fn list(&self) -> Result<Vec<PoolInfo>, Error> {
        self.with_table(LockMode::Shared, |table| {
            let mut pools: Vec<PoolInfo> = table
                .pools()
                .iter()
                .map(|(_, record)| record.info(&self.base))
                .collect();
            pools.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(pools)
        })
    }

    /// Registers a client of `name`. A missing pool and a wrong credential are
    /// indistinguishable once a credential is supplied.
    pub fn bind(
        &self,
        name: &str,
        credential: Option<&[u8]>,
        readonly: bool,
    ) -> Result<ClientBinding, Error> {
        let missing = || {
            let kind = if credential.is_some() {
                ErrorKind::AuthFailure
            } else {
                ErrorKind::PoolNotFound
            };
            Error::new(kind).with_pool(name)
        };
        let snapshot = self.with_table(LockMode::Shared, |table| {
            Ok(table.find_pool(name).map(|(_, record)| record))
        })?;
        let Some(snapshot) = snapshot else {
            return Err(missing());
        };
        let key = unlock(&snapshot, credential)?;

        self.with_table(LockMode::Exclusive, |table| {
            let (pool_slot, mut record) = match table.find_pool(name) {
                Some((slot, record)) if record.token == snapshot.token => (slot, record),
                _ => return Err(missing()),
            };

            let client_slot = table.free_client_slot().ok_or_else(|| {
                Error::new(ErrorKind::RegistryFull)
                    .with_message("no free client slots")
                    .with_pool(name)
            })?;
            let now = now_ms();
            let client_id = table.next_client_id();
            let mut flags = CLIENT_IN_USE;
            if readonly {
                flags |= CLIENT_READONLY;
            }
            table.put_client(
                client_slot,
                &ClientRecord {
                    flags,
                    pool_slot,
                    pool_token: record.token,
                    client_id,
                    pid: std::process::id(),
                    connected_ms: now,
                    last_heartbeat_ms: now,
                    heartbeats: 0,
                },
            );
            record.client_count += 1;
            record.idle_since_ms = 0;
            record.last_heartbeat_ms = now;
            table.put_pool(pool_slot, &record);
            table.bump_generation();
            debug!(pool = name, client_id, readonly, "bound client");

            Ok(ClientBinding {
                pool: name.to_string(),
                pool_slot,
                pool_token: record.token,
                client_slot,
                client_id,
                readonly,
                encrypted: record.has(POOL_ENCRYPTED),
                default_ttl_ms: (record.default_ttl_ms != 0).then_some(record.default_ttl_ms),
                dir: record.dir(&self.base),
                key,
            })
        })
    }

    /// Returns false when the binding was already reaped or the pool destroyed.
    pub fn unbind(&self, binding: &ClientBinding) -> Result<bool, Error> {
        self.with_table(LockMode::Exclusive, |table| {
            match table.client(binding.client_slot) {
                Some(client) if client.client_id == binding.client_id => {}
                _ => return Ok(false),
            }
            table.clear_client(binding.client_slot);
            if let Some(mut record) = table.pool(binding.pool_slot) {
                if record.token == binding.pool_token {
                    record.release_client(now_ms());
                    table.put_pool(binding.pool_slot, &record);
                }
            }
            table.bump_generation();
            debug!(pool = %binding.pool, client_id = binding.client_id, "unbound client");
            Ok(true)
        })
    }

    /// Refreshes the client's and the pool's heartbeat; returns the client's
    /// heartbeat count.
    pub fn heartbeat(&self, binding: &ClientBinding) -> Result<u64, Error> {
        self.with_table(LockMode::Exclusive, |table| {
            let mut record = match table.pool(binding.pool_slot) {
                Some(record) if record.token == binding.pool_token => record,
                _ => return Err(Error::new(ErrorKind::PoolNotFound).with_pool(&binding.pool)),
            };
            let mut client = match table.client(binding.client_slot) {
                Some(client) if client.client_id == binding.client_id => client,
                _ => {
                    return Err(Error::new(ErrorKind::Disconnected)
                        .with_message("client binding was reclaimed")
                        .with_pool(&binding.pool));
                }
            };
            let now = now_ms();
            client.last_heartbeat_ms = now;
            client.heartbeats += 1;
            table.put_client(binding.client_slot, &client);
            record.last_heartbeat_ms = now;
            table.put_pool(binding.pool_slot, &record);
            Ok(client.heartbeats)
        })
    }

    /// Record view plus entry counts read from the pool's storage.
    pub fn stats(&self, name: &str) -> Result<PoolStats, Error> {
        self.with_table(LockMode::Exclusive, |table| {
            let (slot, mut record) = table
                .find_pool(name)
                .ok_or_else(|| Error::new(ErrorKind::PoolNotFound).with_pool(name))?;
            let dir = record.dir(&self.base);
            let lock = LockFile::open_existing(dir.join(LOCK_FILE)).map_err(|err| err.with_pool(name))?;
            let _guard = lock.lock(LockMode::Shared, self.lock_timeout).map_err(|err| err.with_pool(name))?;
            let mut store = EntryStore::new(SegmentChain::open(&dir).map_err(|err| err.with_pool(name))?);
            store.sync(false).map_err(|err| err.with_pool(name))?;
            let usage = store.usage();

            record.capacity = usage.capacity_bytes;
            record.segment_count = usage.segment_count as u32;
            table.put_pool(slot, &record);

            Ok(PoolStats {
                info: record.info(&self.base),
                entry_count: store.live_keys(now_ms()).len(),
                used_bytes: usage.used_bytes,
                dead_bytes: usage.dead_bytes,
                utilization: usage.utilization(),
            })
        })
    }

    /// Force-destroys a pool regardless of connected clients. Their handles
    /// observe the retired chain and fail with `PoolNotFound`.
    pub fn destroy(&self, name: &str) -> Result<(), Error> {
        self.with_table(LockMode::Exclusive, |table| {
            let (slot, record) = table
                .find_pool(name)
                .ok_or_else(|| Error::new(ErrorKind::PoolNotFound).with_pool(name))?;
            self.destroy_slot(table, slot, &record)
        })
    }

    fn destroy_slot(&self, table: &mut Table<'_>, slot: u32, record: &PoolRecord) -> Result<(), Error> {
        let dir = record.dir(&self.base);
        match LockFile::open_existing(dir.join(LOCK_FILE)) {
            Ok(lock) => {
                let _guard = lock
                    .lock(LockMode::Exclusive, self.lock_timeout)
                    .map_err(|err| err.with_pool(&record.name))?;
                match SegmentChain::open(&dir) {
                    Ok(mut chain) => {
                        chain.retire();
                        chain.flush()?;
                        chain.release()?;
                    }
                    Err(err) => {
                        warn!(pool = %record.name, error = %err, "releasing unreadable pool storage");
                        release_dir(&dir)?;
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::PoolNotFound => release_dir(&dir)?,
            Err(err) => return Err(err.with_pool(&record.name)),
        }

        for (client_slot, client) in table.clients() {
            if client.pool_slot == slot && client.pool_token == record.token {
                table.clear_client(client_slot);
            }
        }
        table.clear_pool(slot);
        table.bump_generation();
        info!(pool = %record.name, "destroyed pool");
        Ok(())
    }

    /// Raises (or lowers, down to current capacity) a pool's growth ceiling.
    pub fn set_max_capacity(&self, name: &str, max_capacity: u64) -> Result<(), Error> {
        self.with_table(LockMode::Exclusive, |table| {
            let (slot, mut record) = table
                .find_pool(name)
                .ok_or_else(|| Error::new(ErrorKind::PoolNotFound).with_pool(name))?;
            let dir = record.dir(&self.base);
            let lock = LockFile::open_existing(dir.join(LOCK_FILE)).map_err(|err| err.with_pool(name))?;
            let _guard = lock
                .lock(LockMode::Exclusive, self.lock_timeout)
                .map_err(|err| err.with_pool(name))?;
            let mut chain = SegmentChain::open(&dir).map_err(|err| err.with_pool(name))?;
            if max_capacity < chain.capacity() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "max capacity {max_capacity} is below current capacity {}",
                        chain.capacity()
                    ))
                    .with_pool(name));
            }
            chain.set_max_capacity(max_capacity);
            chain.flush()?;
            record.max_capacity = max_capacity;
            record.capacity = chain.capacity();
            record.segment_count = chain.segment_count() as u32;
            table.put_pool(slot, &record);
            Ok(())
        })
    }

    /// Copies storage counters into the pool's record when it still names the
    /// same incarnation (`token`).
    pub fn record_usage(&self, name: &str, token_dir: &Path, capacity: u64, segments: usize) -> Result<(), Error> {
        self.with_table(LockMode::Exclusive, |table| {
            if let Some((slot, mut record)) = table.find_pool(name) {
                if record.dir(&self.base) == token_dir {
                    record.capacity = capacity;
                    record.segment_count = segments as u32;
                    table.put_pool(slot, &record);
                }
            }
            Ok(())
        })
    }

    /// Drops client records whose process is gone or whose heartbeat is older
    /// than `liveness_timeout`, decrementing their pools' client counts.
    pub fn reap_clients(
        &self,
        now: u64,
        liveness_timeout: Duration,
        probe: &dyn LivenessProbe,
    ) -> Result<usize, Error> {
        let timeout_ms = liveness_timeout.as_millis() as u64;
        self.with_table(LockMode::Exclusive, |table| {
            let mut reaped = 0;
            for (client_slot, client) in table.clients() {
                let stale = now.saturating_sub(client.last_heartbeat_ms) > timeout_ms;
                let gone = !probe.is_alive(client.pid);
                if !stale && !gone {
                    continue;
                }
                table.clear_client(client_slot);
                if let Some(mut record) = table.pool(client.pool_slot) {
                    if record.token == client.pool_token {
                        record.release_client(now);
                        table.put_pool(client.pool_slot, &record);
                        warn!(
                            pool = %record.name,
                            client_id = client.client_id,
                            pid = client.pid,
                            stale,
                            "reclaimed unresponsive client"
                        );
                    }
                }
                reaped += 1;
            }
            if reaped > 0 {
                table.bump_generation();
            }
            Ok(reaped)
        })
    }

    /// Destroys pools that have had no clients for longer than their
    /// idle-destroy timeout. Returns the destroyed names.
    pub fn destroy_idle(&self, now: u64) -> Result<Vec<String>, Error> {
        self.with_table(LockMode::Exclusive, |table| {
            let mut destroyed = Vec::new();
            for (slot, record) in table.pools() {
                if record.client_count != 0 || record.idle_since_ms == 0 {
                    continue;
                }
                if now.saturating_sub(record.idle_since_ms) < record.idle_destroy_ms {
                    continue;
                }
                match self.destroy_slot(table, slot, &record) {
                    Ok(()) => destroyed.push(record.name.clone()),
                    Err(err) => warn!(pool = %record.name, error = %err, "idle destroy failed"),
                }
            }
            Ok(destroyed)
        })
    }

    pub fn global_stats(&self) -> Result<GlobalStats, Error> {
        self.with_table(LockMode::Shared, |table| {
            let pools = table.pools();
            Ok(GlobalStats {
                pool_count: pools.len(),
                client_count: pools.iter().map(|(_, record)| record.client_count as u64).sum(),
                total_capacity: pools.iter().map(|(_, record)| record.capacity).sum(),
                pool_slots: table.pool_slots,
                client_slots: table.client_slots,
            })
        })
    }

    /// Changes whenever a pool or client record is added or removed.
    pub fn generation(&self) -> Result<u64, Error> {
        self.with_table(LockMode::Shared, |table| Ok(table.generation()))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("path", &self.path).finish()
    }
}

pub fn pool_dir(base: &Path, name: &str, token: u64) -> PathBuf {
    base.join(POOLS_DIR).join(format!("{name}-{token:016x}"))
}

/// Checks `credential` against a pool record and derives the payload key for
/// encrypted pools. Runs the slow KDF, so it is called without the table lock.
fn unlock(record: &PoolRecord, credential: Option<&[u8]>) -> Result<Option<PoolKey>, Error> {
    if !record.is_protected() {
        return Ok(None);
    }
    let Some(credential) = credential else {
        return Err(Error::new(ErrorKind::AuthFailure)
            .with_message("credential required")
            .with_pool(&record.name));
    };
    let secret = stretch(credential, &record.salt, record.kdf_rounds).map_err(|err| {
        if err.kind() == ErrorKind::Usage {
            corrupt("pool record has too few kdf rounds").with_pool(&record.name)
        } else {
            err
        }
    })?;
    if record.has(POOL_AUTH) && !constant_time_eq(&secret.verifier()?, &record.verifier) {
        return Err(Error::new(ErrorKind::AuthFailure).with_pool(&record.name));
    }
    if record.has(POOL_ENCRYPTED) {
        Ok(Some(secret.key()?))
    } else {
        Ok(None)
    }
}

fn registry_len(pool_slots: u32, client_slots: u32) -> usize {
    HEADER_LEN + pool_slots as usize * POOL_RECORD_LEN + client_slots as usize * CLIENT_RECORD_LEN
}

fn corrupt(message: &str) -> Error {
    Error::new(ErrorKind::CorruptedRecord).with_message(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::{POOL_AUTH, POOL_IN_USE, PoolRecord, Registry};
    use crate::core::crypto::MIN_KDF_ROUNDS;
    use crate::core::error::ErrorKind;
    use crate::core::options::{PoolOptions, RegistryOptions};
    use crate::core::reclaim::LivenessProbe;
    use std::time::Duration;

    struct AllDead;

    impl LivenessProbe for AllDead {
        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    struct AllAlive;

    impl LivenessProbe for AllAlive {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
    }

    fn small() -> PoolOptions {
        PoolOptions::new()
            .kdf_rounds(MIN_KDF_ROUNDS)
            .initial_capacity(4096)
            .segment_size(4096)
            .max_capacity(64 * 4096)
    }

    fn registry(dir: &std::path::Path) -> Registry {
        Registry::open(
            dir,
            RegistryOptions {
                pool_slots: 4,
                client_slots: 8,
                lock_timeout: Duration::from_secs(2),
            },
        )
        .expect("registry")
    }

    #[test]
    fn pool_record_round_trips() {
        let record = PoolRecord {
            name: "cache".to_string(),
            flags: POOL_IN_USE | POOL_AUTH,
            client_count: 3,
            token: 0xABCD,
            created_ms: 1,
            last_heartbeat_ms: 2,
            idle_since_ms: 0,
            idle_destroy_ms: 60_000,
            default_ttl_ms: 500,
            capacity: 4096,
            max_capacity: 8192,
            segment_size: 4096,
            segment_count: 1,
            salt: [7u8; 16],
            verifier: [9u8; 32],
            kdf_rounds: 123_456,
        };
        assert_eq!(PoolRecord::decode(&record.encode()).expect("decode"), record);
    }

    #[test]
    fn create_lookup_and_duplicate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        let info = registry.create("cache", &small()).expect("create");
        assert!(info.dir.join("seg-00000.lzs").exists());
        assert!(info.idle_since_ms.is_some());

        let err = registry.create("cache", &small()).expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::PoolAlreadyExists);
        assert_eq!(err.pool(), Some("cache"));
        assert!(registry.exists("cache").expect("exists"));
        assert!(registry.lookup("other").expect("lookup").is_none());
    }

    #[test]
    fn registry_is_shared_between_openers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = registry(dir.path());
        a.create("shared", &small()).expect("create");
        let b = Registry::open(dir.path(), RegistryOptions::default()).expect("reopen");
        assert_eq!(b.list().expect("list").len(), 1);
        assert_eq!(b.global_stats().expect("stats").pool_slots, 4);
    }

    #[test]
    fn bind_counts_clients_and_checks_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        registry
            .create("secure", &small().require_auth(true).credential("pw"))
            .expect("create");
        registry.create("open", &small()).expect("create");

        let err = registry.bind("secure", Some(b"nope".as_slice()), false).expect_err("wrong");
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        let err = registry.bind("secure", None, false).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        let err = registry.bind("absent", Some(b"pw".as_slice()), false).expect_err("absent");
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        let err = registry.bind("absent", None, false).expect_err("absent");
        assert_eq!(err.kind(), ErrorKind::PoolNotFound);

        let binding = registry.bind("secure", Some(b"pw".as_slice()), false).expect("bind");
        assert!(binding.key.is_none());
        registry.bind("open", Some(b"anything".as_slice()), true).expect("non-auth pool");
        assert_eq!(registry.lookup("secure").expect("lookup").expect("pool").client_count, 1);

        assert_eq!(registry.heartbeat(&binding).expect("heartbeat"), 1);
        assert!(registry.unbind(&binding).expect("unbind"));
        assert!(!registry.unbind(&binding).expect("unbind twice"));
        let info = registry.lookup("secure").expect("lookup").expect("pool");
        assert_eq!(info.client_count, 0);
        assert!(info.idle_since_ms.is_some());
    }

    #[test]
    fn encrypted_pool_binding_carries_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        registry
            .create("vault", &small().encrypted(true).credential("pw"))
            .expect("create");
        let binding = registry.bind("vault", Some(b"pw".as_slice()), false).expect("bind");
        assert!(binding.encrypted);
        assert!(binding.key.is_some());
    }

    #[test]
    fn kdf_rounds_are_stored_with_the_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        let rounds = MIN_KDF_ROUNDS + 17;
        registry
            .create("stretched", &small().require_auth(true).credential("pw").kdf_rounds(rounds))
            .expect("create");
        registry.create("plain", &small()).expect("create");

        let info = registry.lookup("stretched").expect("lookup").expect("pool");
        assert_eq!(info.kdf_rounds, Some(rounds));
        assert_eq!(registry.lookup("plain").expect("lookup").expect("pool").kdf_rounds, None);

        let reopened = Registry::open(dir.path(), RegistryOptions::default()).expect("reopen");
        reopened
            .bind("stretched", Some(b"pw".as_slice()), false)
            .expect("bind with stored rounds");
        let err = reopened
            .bind("stretched", Some(b"pW".as_slice()), false)
            .expect_err("wrong credential");
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
    }

    #[test]
    fn reap_and_idle_destroy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        registry
            .create("p", &small().idle_destroy(Duration::from_millis(10)))
            .expect("create");
        let binding = registry.bind("p", None, false).expect("bind");

        let now = super::now_ms();
        assert_eq!(
            registry.reap_clients(now, Duration::from_secs(60), &AllAlive).expect("reap"),
            0
        );
        assert!(registry.destroy_idle(now + 1_000).expect("idle").is_empty());

        assert_eq!(
            registry.reap_clients(now, Duration::from_secs(60), &AllDead).expect("reap"),
            1
        );
        let err = registry.heartbeat(&binding).expect_err("reaped");
        assert_eq!(err.kind(), ErrorKind::Disconnected);

        let later = super::now_ms() + 1_000;
        assert_eq!(registry.destroy_idle(later).expect("idle"), vec!["p".to_string()]);
        assert!(!binding.dir.exists());
        assert!(!registry.exists("p").expect("exists"));
    }

    #[test]
    fn destroy_frees_slot_and_clients() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        registry.create("p", &small()).expect("create");
        let binding = registry.bind("p", None, false).expect("bind");
        registry.destroy("p").expect("destroy");
        assert_eq!(registry.destroy("p").expect_err("gone").kind(), ErrorKind::PoolNotFound);
        assert_eq!(registry.heartbeat(&binding).expect_err("gone").kind(), ErrorKind::PoolNotFound);
        assert_eq!(registry.global_stats().expect("stats").client_count, 0);
    }

    #[test]
    fn full_registry_reports_registry_full() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        for i in 0..4 {
            registry.create(&format!("p{i}"), &small()).expect("create");
        }
        let err = registry.create("p4", &small()).expect_err("full");
        assert_eq!(err.kind(), ErrorKind::RegistryFull);
    }

    #[test]
    fn max_capacity_cannot_drop_below_current() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        registry.create("p", &small()).expect("create");
        let err = registry.set_max_capacity("p", 100).expect_err("too small");
        assert_eq!(err.kind(), ErrorKind::Usage);
        registry.set_max_capacity("p", 128 * 4096).expect("raise");
        let stats = registry.stats("p").expect("stats");
        assert_eq!(stats.info.max_capacity, 128 * 4096);
        assert_eq!(stats.entry_count, 0);
    }
}
