//! Purpose: Topic events and request/reply calls carried through a pool directory.
//! Exports: `EventRing`, `EventChannel`, `EventRecord`, `EventKind`, `EventHandler`.
//! Role: A fixed-slot ring file beside the segments; handles append to it and listeners poll it.
//! Invariants: Event `seq` lives in slot `seq % slot_count`; readers lapped by the writer skip ahead.
//! Invariants: Appends hold the pool lock exclusive, reads hold it shared.
//! Invariants: On encrypted pools event payloads are sealed with the topic as AAD.
//!
//! Events are best effort. A listener that falls more than one ring behind
//! loses the overwritten events and logs how many it missed.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::codec::{Codec, TypeTag, Value};
use crate::core::crypto::{PoolKey, open, random_bytes, seal};
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::layout::{crc32, now_ms, read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::core::lock::{LockFile, LockMode};
use crate::core::registry::ClientBinding;
use crate::core::segment::LOCK_FILE;

pub const EVENTS_FILE: &str = "events";
pub const EVENT_SLOTS: u32 = 256;
pub const EVENT_SLOT_LEN: u32 = 4096;
pub const EVENT_HEADER_LEN: usize = 56;
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(2);
pub const MAX_TOPIC_LEN: usize = 255;

const RING_MAGIC: [u8; 4] = *b"LZEV";
const RING_VERSION: u32 = 1;
const RING_HEADER_LEN: usize = 64;
const OFF_VERSION: usize = 4;
const OFF_SLOT_COUNT: usize = 8;
const OFF_SLOT_LEN: usize = 12;
const OFF_NEXT_SEQ: usize = 16;

pub const EVENT_FLAG_SEALED: u16 = 0x1;
pub const EVENT_FLAG_FAILED: u16 = 0x2;

/// Runs on the listener thread. An `Err` on a call is sent back to the caller.
pub type EventHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Emit = 1,
    Call = 2,
    Reply = 3,
}

impl EventKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Emit),
            2 => Some(Self::Call),
            3 => Some(Self::Reply),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub seq: u64,
    pub kind: EventKind,
    pub topic: String,
    pub tag: TypeTag,
    pub flags: u16,
    pub call_id: u64,
    pub sender: u64,
    /// Client id a reply is addressed to; zero for emits and calls.
    pub target: u64,
    pub emitted_ms: u64,
    pub payload: Vec<u8>,
}

pub struct EventRing {
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
    slot_count: u32,
    slot_len: u32,
}

impl EventRing {
    /// Opens the ring in `dir`, creating it on first use. The caller holds the
    /// pool lock exclusively.
    pub fn open_or_create(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| io_error(err, &path))?;
        let existing = file.metadata().map_err(|err| io_error(err, &path))?.len();
        let fresh = existing == 0;
        if fresh {
            let size = RING_HEADER_LEN as u64 + EVENT_SLOTS as u64 * EVENT_SLOT_LEN as u64;
            file.set_len(size).map_err(|err| io_error(err, &path))?;
        }
        // SAFETY: the file stays open for the lifetime of the mapping, and every
        // access goes through bounds-checked slices under the pool lock.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|err| io_error(err, &path))?;
        if fresh {
            mmap[..4].copy_from_slice(&RING_MAGIC);
            write_u32(&mut mmap, OFF_VERSION, RING_VERSION);
            write_u32(&mut mmap, OFF_SLOT_COUNT, EVENT_SLOTS);
            write_u32(&mut mmap, OFF_SLOT_LEN, EVENT_SLOT_LEN);
            write_u64(&mut mmap, OFF_NEXT_SEQ, 0);
        }
        let corrupt = |message: &str| {
            Error::new(ErrorKind::CorruptedRecord)
                .with_message(message.to_string())
                .with_path(&path)
        };
        if mmap.len() < RING_HEADER_LEN || mmap[..4] != RING_MAGIC {
            return Err(corrupt("bad event ring magic"));
        }
        if read_u32(&mmap, OFF_VERSION) != RING_VERSION {
            return Err(corrupt("unsupported event ring version"));
        }
        let slot_count = read_u32(&mmap, OFF_SLOT_COUNT);
        let slot_len = read_u32(&mmap, OFF_SLOT_LEN);
        let needed = RING_HEADER_LEN as u64 + slot_count as u64 * slot_len as u64;
        if slot_count == 0 || (slot_len as usize) <= EVENT_HEADER_LEN || (mmap.len() as u64) < needed {
            return Err(corrupt("event ring geometry does not fit the file"));
        }
        if fresh {
            debug!(path = %path.display(), "created event ring");
        }
        Ok(Self {
            path,
            _file: file,
            mmap,
            slot_count,
            slot_len,
        })
    }

    pub fn next_seq(&self) -> u64 {
        read_u64(&self.mmap, OFF_NEXT_SEQ)
    }

    /// Oldest sequence number whose slot has not been overwritten.
    pub fn oldest_seq(&self) -> u64 {
        self.next_seq().saturating_sub(self.slot_count as u64)
    }

    /// Bytes available for topic plus payload in one slot.
    pub fn capacity(&self) -> usize {
        self.slot_len as usize - EVENT_HEADER_LEN
    }

    /// Writes `record` into the next slot, ignoring its `seq`. Returns the
    /// sequence number assigned.
    pub fn append(&mut self, record: &EventRecord) -> Result<u64, Error> {
        let body_len = record.topic.len() + record.payload.len();
        if body_len > self.capacity() {
            return Err(Error::new(ErrorKind::CapacityExceeded).with_message(format!(
                "event of {body_len} bytes exceeds the {} byte slot",
                self.capacity()
            )));
        }
        let seq = self.next_seq();
        let start = self.slot_offset(seq);
        let body = &mut self.mmap[start + EVENT_HEADER_LEN..start + EVENT_HEADER_LEN + body_len];
        body[..record.topic.len()].copy_from_slice(record.topic.as_bytes());
        body[record.topic.len()..].copy_from_slice(&record.payload);
        let checksum = crc32(body);

        let header = &mut self.mmap[start..start + EVENT_HEADER_LEN];
        write_u64(header, 0, seq);
        header[8] = record.kind as u8;
        header[9] = record.tag as u8;
        write_u16(header, 10, record.flags);
        write_u32(header, 12, record.topic.len() as u32);
        write_u32(header, 16, record.payload.len() as u32);
        write_u32(header, 20, checksum);
        write_u64(header, 24, record.call_id);
        write_u64(header, 32, record.sender);
        write_u64(header, 40, record.target);
        write_u64(header, 48, record.emitted_ms);
        write_u64(&mut self.mmap, OFF_NEXT_SEQ, seq + 1);
        Ok(seq)
    }

    /// Reads event `seq`. `None` when it has not been written yet or its slot
    /// has since been reused.
    pub fn read(&self, seq: u64) -> Result<Option<EventRecord>, Error> {
        if seq >= self.next_seq() {
            return Ok(None);
        }
        let start = self.slot_offset(seq);
        let header = &self.mmap[start..start + EVENT_HEADER_LEN];
        if read_u64(header, 0) != seq {
            return Ok(None);
        }
        let corrupt = |message: &str| {
            Error::new(ErrorKind::CorruptedRecord)
                .with_message(format!("event {seq}: {message}"))
                .with_path(&self.path)
        };
        let kind = EventKind::from_u8(header[8]).ok_or_else(|| corrupt("unknown event kind"))?;
        let tag = TypeTag::from_u8(header[9]).map_err(|_| corrupt("unknown type tag"))?;
        let topic_len = read_u32(header, 12) as usize;
        let payload_len = read_u32(header, 16) as usize;
        if topic_len + payload_len > self.capacity() {
            return Err(corrupt("lengths exceed the slot"));
        }
        let body = &self.mmap[start + EVENT_HEADER_LEN..start + EVENT_HEADER_LEN + topic_len + payload_len];
        if crc32(body) != read_u32(header, 20) {
            return Err(corrupt("checksum mismatch"));
        }
        let topic = String::from_utf8(body[..topic_len].to_vec())
            .map_err(|_| corrupt("topic is not utf-8"))?;
        Ok(Some(EventRecord {
            seq,
            kind,
            topic,
            tag,
            flags: read_u16(header, 10),
            call_id: read_u64(header, 24),
            sender: read_u64(header, 32),
            target: read_u64(header, 40),
            emitted_ms: read_u64(header, 48),
            payload: body[topic_len..].to_vec(),
        }))
    }

    fn slot_offset(&self, seq: u64) -> usize {
        RING_HEADER_LEN + (seq % self.slot_count as u64) as usize * self.slot_len as usize
    }
}

/// One handle's view of a pool's event ring, shared with its listener thread.
pub struct EventChannel {
    pool: String,
    dir: PathBuf,
    client_id: u64,
    encrypted: bool,
    key: Option<PoolKey>,
    codec: Codec,
    lock: LockFile,
    lock_timeout: Duration,
    ring: Mutex<Option<EventRing>>,
    handlers: Mutex<HashMap<String, EventHandler>>,
}

impl EventChannel {
    pub fn open(binding: &ClientBinding, codec: Codec, lock_timeout: Duration) -> Result<Self, Error> {
        let lock = LockFile::open_existing(binding.dir.join(LOCK_FILE))?;
        Ok(Self {
            pool: binding.pool.clone(),
            dir: binding.dir.clone(),
            client_id: binding.client_id,
            encrypted: binding.encrypted,
            key: binding.key.clone(),
            codec,
            lock,
            lock_timeout,
            ring: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    pub fn on(&self, topic: &str, handler: EventHandler) {
        self.handlers.lock().insert(topic.to_string(), handler);
    }

    pub fn off(&self, topic: &str) -> bool {
        self.handlers.lock().remove(topic).is_some()
    }

    /// Sequence number the next event will get.
    pub fn head(&self) -> Result<u64, Error> {
        self.with_ring(LockMode::Shared, |ring| Ok(ring.next_seq()))
    }

    pub fn emit(&self, topic: &str, value: &Value) -> Result<u64, Error> {
        self.publish(EventKind::Emit, topic, value, 0, 0, 0)
    }

    /// Publishes a call and waits for a reply addressed to this client.
    pub fn call(&self, topic: &str, value: &Value, timeout: Duration) -> Result<Value, Error> {
        let call_id = u64::from_le_bytes(random_bytes::<8>()?);
        let deadline = Instant::now() + timeout;
        let seq = self.publish(EventKind::Call, topic, value, 0, call_id, 0)?;
        let mut cursor = seq + 1;
        loop {
            for event in self.read_from(&mut cursor)? {
                if event.kind != EventKind::Reply
                    || event.call_id != call_id
                    || event.target != self.client_id
                {
                    continue;
                }
                let reply = self.value_of(&event)?;
                if event.flags & EVENT_FLAG_FAILED != 0 {
                    let message = match reply {
                        Value::Text(message) => message,
                        other => format!("{other:?}"),
                    };
                    return Err(Error::new(ErrorKind::HandlerFailed)
                        .with_message(message)
                        .with_pool(&self.pool));
                }
                return Ok(reply);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::Timeout)
                    .with_message(format!("no reply on topic {topic:?} within {timeout:?}"))
                    .with_pool(&self.pool));
            }
            thread::sleep(EVENT_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Returns events from `cursor` on and moves `cursor` past them.
    pub fn read_from(&self, cursor: &mut u64) -> Result<Vec<EventRecord>, Error> {
        self.with_ring(LockMode::Shared, |ring| {
            let next = ring.next_seq();
            let oldest = ring.oldest_seq();
            if *cursor < oldest {
                warn!(pool = %self.pool, missed = oldest - *cursor, "event reader fell behind the ring");
                *cursor = oldest;
            }
            let mut events = Vec::new();
            while *cursor < next {
                match ring.read(*cursor) {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {}
                    Err(err) => warn!(pool = %self.pool, error = %err, "skipping unreadable event"),
                }
                *cursor += 1;
            }
            Ok(events)
        })
    }

    /// Runs registered handlers over `events`, replying to calls.
    pub fn dispatch(&self, events: Vec<EventRecord>) {
        for event in events {
            if event.kind == EventKind::Reply {
                continue;
            }
            let Some(handler) = self.handlers.lock().get(&event.topic).cloned() else {
                continue;
            };
            let outcome = self
                .value_of(&event)
                .map_err(|err| err.to_string())
                .and_then(|value| handler(value));
            match (event.kind, outcome) {
                (EventKind::Call, outcome) => {
                    let (reply, flags) = match outcome {
                        Ok(value) => (value, 0),
                        Err(message) => (Value::Text(message), EVENT_FLAG_FAILED),
                    };
                    if let Err(err) = self.publish(
                        EventKind::Reply,
                        &event.topic,
                        &reply,
                        flags,
                        event.call_id,
                        event.sender,
                    ) {
                        warn!(pool = %self.pool, topic = %event.topic, error = %err, "failed to send reply");
                    }
                }
                (_, Err(message)) => {
                    warn!(pool = %self.pool, topic = %event.topic, error = %message, "event handler failed");
                }
                (_, Ok(_)) => {}
            }
        }
    }

    fn publish(
        &self,
        kind: EventKind,
        topic: &str,
        value: &Value,
        flags: u16,
        call_id: u64,
        target: u64,
    ) -> Result<u64, Error> {
        if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("topic must be 1..={MAX_TOPIC_LEN} bytes"))
                .with_pool(&self.pool));
        }
        let (tag, encoded) = self.codec.encode(value)?;
        let (flags, payload) = match (self.encrypted, self.key.as_ref()) {
            (true, Some(key)) => (flags | EVENT_FLAG_SEALED, seal(key, &encoded, topic.as_bytes())?),
            (true, None) => {
                return Err(Error::new(ErrorKind::AuthFailure)
                    .with_message("encrypted pool handle has no key")
                    .with_pool(&self.pool));
            }
            (false, _) => (flags, encoded),
        };
        let record = EventRecord {
            seq: 0,
            kind,
            topic: topic.to_string(),
            tag,
            flags,
            call_id,
            sender: self.client_id,
            target,
            emitted_ms: now_ms(),
            payload,
        };
        self.with_ring(LockMode::Exclusive, |ring| ring.append(&record))
    }

    fn value_of(&self, event: &EventRecord) -> Result<Value, Error> {
        let sealed = event.flags & EVENT_FLAG_SEALED != 0;
        if sealed != self.encrypted {
            return Err(Error::new(ErrorKind::IntegrityFailure)
                .with_message("event encryption does not match pool")
                .with_pool(&self.pool));
        }
        match (sealed, self.key.as_ref()) {
            (true, Some(key)) => {
                let plain = open(key, &event.payload, event.topic.as_bytes())?;
                self.codec.decode(event.tag, &plain)
            }
            (true, None) => Err(Error::new(ErrorKind::AuthFailure)
                .with_message("encrypted pool handle has no key")
                .with_pool(&self.pool)),
            (false, _) => self.codec.decode(event.tag, &event.payload),
        }
    }

    fn with_ring<T>(
        &self,
        mode: LockMode,
        f: impl FnOnce(&mut EventRing) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if !self.dir.join(LOCK_FILE).exists() {
            return Err(Error::new(ErrorKind::PoolNotFound)
                .with_message("pool was destroyed")
                .with_pool(&self.pool));
        }
        let mut slot = self.ring.lock();
        let mode = if slot.is_none() { LockMode::Exclusive } else { mode };
        let _guard = self
            .lock
            .lock(mode, self.lock_timeout)
            .map_err(|err| err.or_pool(&self.pool))?;
        if slot.is_none() {
            let ring = EventRing::open_or_create(&self.dir).map_err(|err| err.or_pool(&self.pool))?;
            *slot = Some(ring);
        }
        let ring = slot.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("event ring was not opened")
        })?;
        f(ring).map_err(|err| err.or_pool(&self.pool))
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("pool", &self.pool)
            .field("client_id", &self.client_id)
            .field("topics", &self.handlers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{EVENT_SLOTS, EventKind, EventRecord, EventRing, EVENTS_FILE};
    use crate::core::codec::TypeTag;
    use crate::core::error::ErrorKind;

    fn record(topic: &str, payload: &[u8]) -> EventRecord {
        EventRecord {
            seq: 0,
            kind: EventKind::Emit,
            topic: topic.to_string(),
            tag: TypeTag::Bytes,
            flags: 0,
            call_id: 0,
            sender: 7,
            target: 0,
            emitted_ms: 1,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn appended_events_read_back_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ring = EventRing::open_or_create(dir.path()).expect("ring");
        assert_eq!(ring.append(&record("a", b"one")).expect("append"), 0);
        assert_eq!(ring.append(&record("b", b"two")).expect("append"), 1);

        let reopened = EventRing::open_or_create(dir.path()).expect("reopen");
        assert_eq!(reopened.next_seq(), 2);
        let second = reopened.read(1).expect("read").expect("event");
        assert_eq!(second.topic, "b");
        assert_eq!(second.payload, b"two");
        assert_eq!(second.sender, 7);
        assert!(reopened.read(2).expect("read").is_none());
    }

    #[test]
    fn lapped_slots_are_not_returned_as_old_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ring = EventRing::open_or_create(dir.path()).expect("ring");
        for i in 0..EVENT_SLOTS as u64 + 3 {
            ring.append(&record("t", &i.to_le_bytes())).expect("append");
        }
        assert_eq!(ring.oldest_seq(), 3);
        assert!(ring.read(0).expect("read").is_none());
        let newest = ring.read(EVENT_SLOTS as u64 + 2).expect("read").expect("event");
        assert_eq!(newest.payload, (EVENT_SLOTS as u64 + 2).to_le_bytes());
    }

    #[test]
    fn oversized_events_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ring = EventRing::open_or_create(dir.path()).expect("ring");
        let big = vec![0u8; ring.capacity()];
        let err = ring.append(&record("t", &big)).expect_err("too big");
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(ring.next_seq(), 0);
    }

    #[test]
    fn damaged_event_body_fails_its_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ring = EventRing::open_or_create(dir.path()).expect("ring");
        ring.append(&record("t", b"payload")).expect("append");
        drop(ring);

        let path = dir.path().join(EVENTS_FILE);
        let mut bytes = std::fs::read(&path).expect("read file");
        let body = super::RING_HEADER_LEN + super::EVENT_HEADER_LEN + 2;
        bytes[body] ^= 0xFF;
        std::fs::write(&path, bytes).expect("write file");

        let ring = EventRing::open_or_create(dir.path()).expect("reopen");
        let err = ring.read(0).expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::CorruptedRecord);
    }
}
