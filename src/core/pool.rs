//! Purpose: A process's live connection to one pool.
//! Exports: `PoolHandle`, `Namespace`, `EntryInfo`.
//! Role: Typed get/set and event surface; encodes, seals, and routes every access through the pool lock.
//! Invariants: Reads hold the pool lock shared, writes hold it exclusive.
//! Invariants: On an encrypted pool every stored payload is sealed; plaintext is never written.
//! Invariants: Read-modify-write helpers run under a single exclusive lock acquisition.
//!
//! Each handle runs a heartbeat thread that refreshes its registry record every
//! `HEARTBEAT_INTERVAL`, so an idle handle stays live. The thread ends when the
//! handle disconnects or the registry no longer knows the binding. Dropping the
//! handle stops its threads and disconnects it.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::codec::{Codec, Value};
use crate::core::crypto::{PoolKey, open, seal};
use crate::core::error::{Error, ErrorKind};
use crate::core::events::{EVENT_POLL_INTERVAL, EventChannel};
use crate::core::layout::now_ms;
use crate::core::lock::{LockFile, LockMode};
use crate::core::registry::{ClientBinding, PoolStats, Registry};
use crate::core::segment::{LOCK_FILE, SegmentChain};
use crate::core::store::{ENTRY_FLAG_ENCRYPTED, EntryStore, MemoryUsage, RawEntry};
use crate::core::ticker::Ticker;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const NAMESPACE_SEPARATOR: char = ':';

/// A value together with its entry metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryInfo {
    pub value: Value,
    pub version: u64,
    pub expires_at_ms: Option<u64>,
}

struct HandleState {
    store: EntryStore,
    last_heartbeat: Instant,
    connected: bool,
}

pub struct PoolHandle {
    registry: Arc<Registry>,
    binding: Arc<ClientBinding>,
    codec: Codec,
    lock: LockFile,
    state: Mutex<HandleState>,
    events: Arc<EventChannel>,
    heartbeat: Option<Ticker>,
    listener: Mutex<Option<Ticker>>,
    /// Set by the heartbeat thread once the registry drops this binding.
    released: Arc<AtomicBool>,
}

impl PoolHandle {
    /// Maps the bound pool's storage. On failure the binding is released.
    pub(crate) fn attach(
        registry: Arc<Registry>,
        binding: ClientBinding,
        codec: Codec,
    ) -> Result<Self, Error> {
        let binding = Arc::new(binding);
        let released = Arc::new(AtomicBool::new(false));
        let opened = LockFile::open_existing(binding.dir.join(LOCK_FILE)).and_then(|lock| {
            let store = {
                let _guard = lock.lock(LockMode::Shared, registry.lock_timeout())?;
                EntryStore::new(SegmentChain::open(&binding.dir)?)
            };
            let events = EventChannel::open(&binding, codec, registry.lock_timeout())?;
            let heartbeat =
                spawn_heartbeat(Arc::clone(&registry), Arc::clone(&binding), Arc::clone(&released))?;
            Ok((lock, store, events, heartbeat))
        });
        let (lock, store, events, heartbeat) = match opened {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(unbind_err) = registry.unbind(&binding) {
                    warn!(pool = %binding.pool, error = %unbind_err, "failed to release binding");
                }
                return Err(err.or_pool(&binding.pool));
            }
        };
        debug!(pool = %binding.pool, client_id = binding.client_id, "attached pool handle");
        Ok(Self {
            registry,
            binding,
            codec,
            lock,
            state: Mutex::new(HandleState {
                store,
                last_heartbeat: Instant::now(),
                connected: true,
            }),
            events: Arc::new(events),
            heartbeat: Some(heartbeat),
            listener: Mutex::new(None),
            released,
        })
    }

    pub fn name(&self) -> &str {
        &self.binding.pool
    }

    pub fn is_readonly(&self) -> bool {
        self.binding.readonly
    }

    pub fn is_encrypted(&self) -> bool {
        self.binding.encrypted
    }

    pub fn client_id(&self) -> u64 {
        self.binding.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Stores `value` under `key`, applying the pool's default TTL if it has
    /// one. Returns the version assigned to the write.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<u64, Error> {
        let expires = self.expiry(None);
        let value = value.into();
        self.write(|ctx| ctx.put(key, &value, expires))
    }

    pub fn set_with_ttl(&self, key: &str, value: impl Into<Value>, ttl: Duration) -> Result<u64, Error> {
        if ttl.is_zero() {
            return Err(Error::new(ErrorKind::Usage).with_message("ttl must be positive").with_key(key));
        }
        let expires = self.expiry(Some(ttl));
        let value = value.into();
        self.write(|ctx| ctx.put(key, &value, expires))
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        Ok(self.get_entry(key)?.map(|entry| entry.value))
    }

    pub fn get_entry(&self, key: &str) -> Result<Option<EntryInfo>, Error> {
        self.read(|ctx| ctx.fetch(key))
    }

    pub fn exists(&self, key: &str) -> Result<bool, Error> {
        let now = now_ms();
        self.read(|ctx| Ok(ctx.raw(key)?.is_some_and(|raw| !is_expired(&raw, now))))
    }

    /// True only when an unexpired entry was removed; an expired entry is
    /// still cleared but reported as absent.
    pub fn delete(&self, key: &str) -> Result<bool, Error> {
        let now = now_ms();
        self.write(|ctx| ctx.remove(key, now))
    }

    /// Writes every pair under one lock acquisition, in order. A failure
    /// leaves the earlier pairs written.
    pub fn mset<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<usize, Error>
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        let expires = self.expiry(None);
        let pairs: Vec<(K, Value)> = pairs.into_iter().map(|(k, v)| (k, v.into())).collect();
        self.write(|ctx| {
            for (key, value) in &pairs {
                ctx.put(key.as_ref(), value, expires)?;
            }
            Ok(pairs.len())
        })
    }

    /// Results line up with `keys`; absent or expired keys are `None`.
    pub fn mget<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<Option<Value>>, Error> {
        self.read(|ctx| {
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                values.push(ctx.fetch(key.as_ref())?.map(|entry| entry.value));
            }
            Ok(values)
        })
    }

    pub fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<usize, Error> {
        self.write(|ctx| {
            let now = now_ms();
            let mut removed = 0;
            for key in keys {
                if ctx.remove(key.as_ref(), now)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Unexpired keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>, Error> {
        self.keys_with_prefix("")
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let now = now_ms();
        self.read(|ctx| {
            let mut keys: Vec<String> = ctx
                .store
                .live_keys(now)
                .into_iter()
                .filter(|key| key.starts_with(prefix))
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> Result<usize, Error> {
        let now = now_ms();
        self.read(|ctx| Ok(ctx.store.live_keys(now).len()))
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Adds `delta` to an integer entry; a missing key counts from zero. The
    /// entry keeps its expiry.
    pub fn increment(&self, key: &str, delta: i64) -> Result<i64, Error> {
        let default_expiry = self.expiry(None);
        self.write(|ctx| {
            let (current, expires) = match ctx.fetch(key)? {
                Some(entry) => {
                    let number = entry.value.as_i64().ok_or_else(|| {
                        Error::new(ErrorKind::Serialization)
                            .with_message("increment target is not an integer")
                            .with_key(key)
                    })?;
                    (number, entry.expires_at_ms.unwrap_or(0))
                }
                None => (0, default_expiry),
            };
            let next = current.checked_add(delta).ok_or_else(|| {
                Error::new(ErrorKind::Serialization)
                    .with_message("integer overflow")
                    .with_key(key)
            })?;
            ctx.put(key, &Value::Int(next), expires)?;
            Ok(next)
        })
    }

    pub fn decrement(&self, key: &str, delta: i64) -> Result<i64, Error> {
        let negated = delta.checked_neg().ok_or_else(|| {
            Error::new(ErrorKind::Serialization)
                .with_message("integer overflow")
                .with_key(key)
        })?;
        self.increment(key, negated)
    }

    /// Pushes onto a list entry, starting an empty list when the key is
    /// missing. Returns the new length.
    pub fn append(&self, key: &str, value: impl Into<Value>) -> Result<usize, Error> {
        let default_expiry = self.expiry(None);
        let value = value.into();
        self.write(|ctx| {
            let (mut items, expires) = match ctx.fetch(key)? {
                Some(EntryInfo {
                    value: Value::List(items),
                    expires_at_ms,
                    ..
                }) => (items, expires_at_ms.unwrap_or(0)),
                Some(_) => {
                    return Err(Error::new(ErrorKind::Serialization)
                        .with_message("append target is not a list")
                        .with_key(key));
                }
                None => (Vec::new(), default_expiry),
            };
            items.push(value);
            let len = items.len();
            ctx.put(key, &Value::List(items), expires)?;
            Ok(len)
        })
    }

    /// Merges `fields` into a map entry, starting an empty map when the key is
    /// missing. Returns the merged field count.
    pub fn update(&self, key: &str, fields: BTreeMap<String, Value>) -> Result<usize, Error> {
        let default_expiry = self.expiry(None);
        self.write(|ctx| {
            let (mut map, expires) = match ctx.fetch(key)? {
                Some(EntryInfo {
                    value: Value::Map(map),
                    expires_at_ms,
                    ..
                }) => (map, expires_at_ms.unwrap_or(0)),
                Some(_) => {
                    return Err(Error::new(ErrorKind::Serialization)
                        .with_message("update target is not a map")
                        .with_key(key));
                }
                None => (BTreeMap::new(), default_expiry),
            };
            map.extend(fields);
            let len = map.len();
            ctx.put(key, &Value::Map(map), expires)?;
            Ok(len)
        })
    }

    pub fn namespace(&self, prefix: &str) -> Namespace<'_> {
        Namespace {
            handle: self,
            prefix: format!("{prefix}{NAMESPACE_SEPARATOR}"),
        }
    }

    /// Refreshes this client's liveness in the registry.
    pub fn heartbeat(&self) -> Result<u64, Error> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(self.disconnected());
        }
        self.beat(&mut state)
    }

    pub fn stats(&self) -> Result<PoolStats, Error> {
        self.registry.stats(&self.binding.pool)
    }

    /// Registers `handler` for `topic`, replacing any earlier one. Handlers run
    /// on the listener thread started by `listen`.
    pub fn on_event<F>(&self, topic: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.events.on(topic, Arc::new(handler));
    }

    pub fn off_event(&self, topic: &str) -> bool {
        self.events.off(topic)
    }

    /// Starts the listener thread. It sees events emitted from now on,
    /// including this handle's own. Calling it twice is a no-op.
    pub fn listen(&self) -> Result<(), Error> {
        self.ensure_connected()?;
        let mut listener = self.listener.lock();
        if listener.as_ref().is_some_and(Ticker::is_running) {
            return Ok(());
        }
        let mut cursor = self.events.head()?;
        let events = Arc::clone(&self.events);
        let released = Arc::clone(&self.released);
        let pool = self.binding.pool.clone();
        let ticker = Ticker::spawn(
            format!("latzero-events-{}", self.binding.client_id),
            EVENT_POLL_INTERVAL,
            move || {
                if released.load(Ordering::SeqCst) {
                    debug!(pool = %pool, "binding released; event listener stopping");
                    return ControlFlow::Break(());
                }
                match events.read_from(&mut cursor) {
                    Ok(batch) => {
                        events.dispatch(batch);
                        ControlFlow::Continue(())
                    }
                    Err(err) if err.kind() == ErrorKind::PoolNotFound => {
                        debug!(pool = %pool, "pool gone; event listener stopping");
                        ControlFlow::Break(())
                    }
                    Err(err) => {
                        warn!(pool = %pool, error = %err, "event poll failed");
                        ControlFlow::Continue(())
                    }
                }
            },
        )?;
        *listener = Some(ticker);
        debug!(pool = %self.binding.pool, client_id = self.binding.client_id, "listening for events");
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listener.lock().as_ref().is_some_and(Ticker::is_running)
    }

    /// Publishes `value` on `topic` to every listening handle. Returns the
    /// event's sequence number.
    pub fn emit_event(&self, topic: &str, value: impl Into<Value>) -> Result<u64, Error> {
        self.ensure_connected()?;
        self.events.emit(topic, &value.into())
    }

    /// Sends `value` to whichever listener handles `topic` and waits for its
    /// reply. Fails with `Timeout` if none arrives in time and with
    /// `HandlerFailed` if the handler returned an error.
    ///
    /// Calling this from inside a handler on the same handle blocks that
    /// handle's listener until the timeout.
    pub fn call_event(
        &self,
        topic: &str,
        value: impl Into<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        self.ensure_connected()?;
        self.events.call(topic, &value.into(), timeout)
    }

    /// Stops the listener thread. Registered handlers are kept.
    pub fn stop_events(&self) -> Result<(), Error> {
        let ticker = self.listener.lock().take();
        match ticker {
            Some(mut ticker) => ticker.stop(),
            None => Ok(()),
        }
    }

    pub fn memory_usage(&self) -> Result<MemoryUsage, Error> {
        self.read(|ctx| Ok(ctx.store.usage()))
    }

    /// Reclaims dead space without moving live entries. Returns bytes handed
    /// back to segment bump pointers.
    pub fn compact(&self) -> Result<u64, Error> {
        self.write(|ctx| ctx.store.compact())
    }

    /// Releases the binding now instead of at drop, surfacing any error.
    pub fn disconnect(mut self) -> Result<(), Error> {
        self.stop_threads();
        let mut state = self.state.lock();
        if !state.connected {
            return Ok(());
        }
        state.connected = false;
        drop(state);
        self.registry.unbind(&self.binding)?;
        Ok(())
    }

    pub(crate) fn raw_entries(&self) -> Result<Vec<RawEntry>, Error> {
        let now = now_ms();
        self.read(|ctx| {
            let mut keys = ctx.store.live_keys(now);
            keys.sort();
            let mut entries = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(raw) = ctx.raw(&key)? {
                    entries.push(raw);
                }
            }
            Ok(entries)
        })
    }

    pub(crate) fn put_raw(&self, entries: &[RawEntry]) -> Result<usize, Error> {
        let now = now_ms();
        self.write(|ctx| {
            let mut restored = 0;
            for raw in entries {
                if is_expired(raw, now) {
                    continue;
                }
                if self.binding.encrypted != (raw.flags & ENTRY_FLAG_ENCRYPTED != 0) {
                    return Err(Error::new(ErrorKind::IntegrityFailure)
                        .with_message("snapshot encryption does not match pool")
                        .with_key(&raw.key));
                }
                ctx.store
                    .put(&raw.key, raw.tag, raw.flags, &raw.payload, raw.expires_at_ms)
                    .map_err(|err| err.or_key(&raw.key))?;
                restored += 1;
            }
            Ok(restored)
        })
    }

    fn expiry(&self, ttl: Option<Duration>) -> u64 {
        let ttl_ms = match ttl {
            Some(ttl) => (ttl.as_millis() as u64).max(1),
            None => match self.binding.default_ttl_ms {
                Some(ms) => ms,
                None => return 0,
            },
        };
        now_ms().saturating_add(ttl_ms)
    }

    fn disconnected(&self) -> Error {
        Error::new(ErrorKind::Disconnected).with_pool(&self.binding.pool)
    }

    fn beat(&self, state: &mut HandleState) -> Result<u64, Error> {
        match self.registry.heartbeat(&self.binding) {
            Ok(count) => {
                state.last_heartbeat = Instant::now();
                Ok(count)
            }
            Err(err) => {
                if matches!(err.kind(), ErrorKind::Disconnected | ErrorKind::PoolNotFound) {
                    state.connected = false;
                }
                Err(err)
            }
        }
    }

    /// Checks the binding and that the mapped pool has not been destroyed,
    /// without taking the pool lock.
    fn ensure_connected(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        self.ready(&mut state)?;
        if state.store.chain().is_retired() {
            return Err(Error::new(ErrorKind::PoolNotFound)
                .with_message("pool was destroyed")
                .with_pool(&self.binding.pool));
        }
        if self.released.load(Ordering::SeqCst) {
            return Err(self.disconnected());
        }
        Ok(())
    }

    fn stop_threads(&mut self) {
        let listener = self.listener.get_mut().take();
        for mut ticker in listener.into_iter().chain(self.heartbeat.take()) {
            if let Err(err) = ticker.stop() {
                warn!(pool = %self.binding.pool, error = %err, "background thread did not stop cleanly");
            }
        }
    }

    fn ready(&self, state: &mut HandleState) -> Result<(), Error> {
        if !state.connected {
            return Err(self.disconnected());
        }
        if state.last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            self.beat(state)?;
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Ctx<'_>) -> Result<T, Error>) -> Result<T, Error> {
        let mut state = self.state.lock();
        self.ready(&mut state)?;
        let _guard = self
            .lock
            .lock(LockMode::Shared, self.registry.lock_timeout())
            .map_err(|err| err.or_pool(&self.binding.pool))?;
        self.sync(&mut state.store, false)?;
        let ctx = Ctx {
            store: &mut state.store,
            codec: &self.codec,
            key: self.binding.key.as_ref(),
            encrypted: self.binding.encrypted,
        };
        f(&ctx).map_err(|err| err.or_pool(&self.binding.pool))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Ctx<'_>) -> Result<T, Error>) -> Result<T, Error> {
        if self.binding.readonly {
            return Err(Error::new(ErrorKind::ReadOnly).with_pool(&self.binding.pool));
        }
        let mut state = self.state.lock();
        self.ready(&mut state)?;
        let _guard = self
            .lock
            .lock(LockMode::Exclusive, self.registry.lock_timeout())
            .map_err(|err| err.or_pool(&self.binding.pool))?;
        self.sync(&mut state.store, true)?;
        let mut ctx = Ctx {
            store: &mut state.store,
            codec: &self.codec,
            key: self.binding.key.as_ref(),
            encrypted: self.binding.encrypted,
        };
        f(&mut ctx).map_err(|err| err.or_pool(&self.binding.pool))
    }

    fn sync(&self, store: &mut EntryStore, writable: bool) -> Result<(), Error> {
        if store.chain().is_retired() {
            return Err(Error::new(ErrorKind::PoolNotFound)
                .with_message("pool was destroyed")
                .with_pool(&self.binding.pool));
        }
        store.sync(writable).map_err(|err| err.or_pool(&self.binding.pool))
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.stop_threads();
        let connected = std::mem::replace(&mut self.state.get_mut().connected, false);
        if !connected {
            return;
        }
        if let Err(err) = self.registry.unbind(&self.binding) {
            warn!(pool = %self.binding.pool, error = %err, "implicit disconnect failed");
        }
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("pool", &self.binding.pool)
            .field("client_id", &self.binding.client_id)
            .field("readonly", &self.binding.readonly)
            .field("encrypted", &self.binding.encrypted)
            .finish()
    }
}

fn spawn_heartbeat(
    registry: Arc<Registry>,
    binding: Arc<ClientBinding>,
    released: Arc<AtomicBool>,
) -> Result<Ticker, Error> {
    let name = format!("latzero-heartbeat-{}", binding.client_id);
    Ticker::spawn(name, HEARTBEAT_INTERVAL, move || {
        match registry.heartbeat(&binding) {
            Ok(_) => ControlFlow::Continue(()),
            Err(err) if matches!(err.kind(), ErrorKind::Disconnected | ErrorKind::PoolNotFound) => {
                debug!(pool = %binding.pool, client_id = binding.client_id, "binding released; heartbeat stopping");
                released.store(true, Ordering::SeqCst);
                ControlFlow::Break(())
            }
            Err(err) => {
                warn!(pool = %binding.pool, error = %err, "heartbeat failed");
                ControlFlow::Continue(())
            }
        }
    })
}

/// Store access for one locked operation.
struct Ctx<'a> {
    store: &'a mut EntryStore,
    codec: &'a Codec,
    key: Option<&'a PoolKey>,
    encrypted: bool,
}

impl Ctx<'_> {
    fn raw(&self, key: &str) -> Result<Option<RawEntry>, Error> {
        self.store.get(key)
    }

    fn fetch(&self, key: &str) -> Result<Option<EntryInfo>, Error> {
        let Some(raw) = self.raw(key)? else {
            return Ok(None);
        };
        if is_expired(&raw, now_ms()) {
            return Ok(None);
        }
        let plain = if raw.flags & ENTRY_FLAG_ENCRYPTED != 0 {
            let pool_key = self.key.ok_or_else(|| {
                Error::new(ErrorKind::IntegrityFailure)
                    .with_message("entry is sealed but no key is bound")
                    .with_key(key)
            })?;
            open(pool_key, &raw.payload, key.as_bytes()).map_err(|err| err.with_key(key))?
        } else if self.encrypted {
            return Err(Error::new(ErrorKind::IntegrityFailure)
                .with_message("plaintext entry in encrypted pool")
                .with_key(key));
        } else {
            raw.payload
        };
        let value = self.codec.decode(raw.tag, &plain).map_err(|err| {
            Error::new(ErrorKind::CorruptedRecord)
                .with_message(err.message().unwrap_or("undecodable payload").to_string())
                .with_key(key)
        })?;
        Ok(Some(EntryInfo {
            value,
            version: raw.version,
            expires_at_ms: (raw.expires_at_ms != 0).then_some(raw.expires_at_ms),
        }))
    }

    fn remove(&mut self, key: &str, now: u64) -> Result<bool, Error> {
        let live = self.store.is_live(key, now);
        Ok(self.store.remove(key)? && live)
    }

    fn put(&mut self, key: &str, value: &Value, expires_at_ms: u64) -> Result<u64, Error> {
        let (tag, payload) = self.codec.encode(value).map_err(|err| err.with_key(key))?;
        let (flags, payload) = if self.encrypted {
            let pool_key = self.key.ok_or_else(|| {
                Error::new(ErrorKind::AuthFailure)
                    .with_message("encrypted pool requires a bound key")
                    .with_key(key)
            })?;
            (ENTRY_FLAG_ENCRYPTED, seal(pool_key, &payload, key.as_bytes())?)
        } else {
            (0, payload)
        };
        self.store
            .put(key, tag, flags, &payload, expires_at_ms)
            .map_err(|err| err.or_key(key))
    }
}

fn is_expired(raw: &RawEntry, now: u64) -> bool {
    raw.expires_at_ms != 0 && now >= raw.expires_at_ms
}

/// Prefixed view over a handle: `ns.set("k", v)` stores `"<prefix>:k"`.
pub struct Namespace<'a> {
    handle: &'a PoolHandle,
    prefix: String,
}

impl Namespace<'_> {
    fn full(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<u64, Error> {
        self.handle.set(&self.full(key), value)
    }

    pub fn set_with_ttl(&self, key: &str, value: impl Into<Value>, ttl: Duration) -> Result<u64, Error> {
        self.handle.set_with_ttl(&self.full(key), value, ttl)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        self.handle.get(&self.full(key))
    }

    pub fn exists(&self, key: &str) -> Result<bool, Error> {
        self.handle.exists(&self.full(key))
    }

    pub fn delete(&self, key: &str) -> Result<bool, Error> {
        self.handle.delete(&self.full(key))
    }

    pub fn increment(&self, key: &str, delta: i64) -> Result<i64, Error> {
        self.handle.increment(&self.full(key), delta)
    }

    /// Keys inside the namespace with the prefix stripped.
    pub fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .handle
            .keys_with_prefix(&self.prefix)?
            .into_iter()
            .map(|key| key[self.prefix.len()..].to_string())
            .collect())
    }

    pub fn clear(&self) -> Result<usize, Error> {
        let keys = self.handle.keys_with_prefix(&self.prefix)?;
        self.handle.delete_many(&keys)
    }
}
