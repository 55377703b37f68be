//! Purpose: Lay entry records out inside a segment chain and find them again.
//! Exports: `EntryStore`, `EntryHeader`, `RawEntry`, `MemoryUsage`, `ENTRY_HEADER_LEN`.
//! Role: Slot allocation (in-place rewrite, free-slot reuse, bump, growth) and key index.
//! Invariants: The local index is valid only while the chain generation matches.
//! Invariants: A write that relocates an entry commits the new slot before retiring the old one.
//! Invariants: A malformed record is skipped or evicted; it never fails the whole pool.
//! Invariants: A live record's body is covered by a CRC-32 in its header; a mismatch fails that key only.

use std::collections::HashMap;

use tracing::warn;

use crate::core::codec::TypeTag;
use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{
    align8, crc32, now_ms, read_u16, read_u32, read_u64, write_u16, write_u32, write_u64,
};
use crate::core::segment::{Address, SEGMENT_HEADER_LEN, SegmentChain};

pub const ENTRY_HEADER_LEN: usize = 56;
pub const ENTRY_FLAG_ENCRYPTED: u32 = 0x1;

const ENTRY_MAGIC: u16 = 0x4C5A;
const STATE_LIVE: u8 = 1;
const STATE_DEAD: u8 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryState {
    Live,
    Dead,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryHeader {
    pub state: EntryState,
    pub tag: u8,
    pub flags: u32,
    pub key_len: u32,
    pub payload_len: u32,
    pub slot_len: u32,
    pub expires_at_ms: u64,
    pub version: u64,
    pub written_ms: u64,
    pub checksum: u32,
}

impl EntryHeader {
    pub fn encode(&self) -> [u8; ENTRY_HEADER_LEN] {
        let mut buf = [0u8; ENTRY_HEADER_LEN];
        write_u16(&mut buf, 0, ENTRY_MAGIC);
        buf[2] = match self.state {
            EntryState::Live => STATE_LIVE,
            EntryState::Dead => STATE_DEAD,
        };
        buf[3] = self.tag;
        write_u32(&mut buf, 4, self.flags);
        write_u32(&mut buf, 8, self.key_len);
        write_u32(&mut buf, 12, self.payload_len);
        write_u32(&mut buf, 16, self.slot_len);
        write_u32(&mut buf, 20, self.payload_len ^ 0xFFFF_FFFF);
        write_u64(&mut buf, 24, self.expires_at_ms);
        write_u64(&mut buf, 32, self.version);
        write_u64(&mut buf, 40, self.written_ms);
        write_u32(&mut buf, 48, self.checksum);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < ENTRY_HEADER_LEN {
            return Err(corrupt("entry header truncated"));
        }
        if read_u16(buf, 0) != ENTRY_MAGIC {
            return Err(corrupt("bad entry magic"));
        }
        let state = match buf[2] {
            STATE_LIVE => EntryState::Live,
            STATE_DEAD => EntryState::Dead,
            _ => return Err(corrupt("invalid entry state")),
        };
        let payload_len = read_u32(buf, 12);
        if payload_len ^ read_u32(buf, 20) != 0xFFFF_FFFF {
            return Err(corrupt("payload length xor mismatch"));
        }
        let header = Self {
            state,
            tag: buf[3],
            flags: read_u32(buf, 4),
            key_len: read_u32(buf, 8),
            payload_len,
            slot_len: read_u32(buf, 16),
            expires_at_ms: read_u64(buf, 24),
            version: read_u64(buf, 32),
            written_ms: read_u64(buf, 40),
            checksum: read_u32(buf, 48),
        };
        let slot_len = header.slot_len as usize;
        if slot_len < ENTRY_HEADER_LEN || slot_len % 8 != 0 {
            return Err(corrupt("invalid slot length"));
        }
        if state == EntryState::Live
            && ENTRY_HEADER_LEN + header.key_len as usize + header.payload_len as usize > slot_len
        {
            return Err(corrupt("entry overflows its slot"));
        }
        Ok(header)
    }

    fn dead(slot_len: u32) -> Self {
        Self {
            state: EntryState::Dead,
            tag: 0,
            flags: 0,
            key_len: 0,
            payload_len: 0,
            slot_len,
            expires_at_ms: 0,
            version: 0,
            written_ms: 0,
            checksum: 0,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms != 0 && now_ms >= self.expires_at_ms
    }
}

pub fn slot_len_for(key_len: usize, payload_len: usize) -> usize {
    align8(ENTRY_HEADER_LEN + key_len + payload_len)
}

/// One stored record as read from the chain; the payload is still sealed
/// and encoded.
#[derive(Clone, Debug)]
pub struct RawEntry {
    pub key: String,
    pub tag: TypeTag,
    pub flags: u32,
    pub expires_at_ms: u64,
    pub version: u64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    addr: Address,
    slot_len: u32,
    version: u64,
    expires_at_ms: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub dead_bytes: u64,
    pub capacity_bytes: u64,
    pub max_bytes: u64,
    pub segment_count: usize,
}

impl MemoryUsage {
    pub fn utilization(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.capacity_bytes as f64
    }
}

pub struct EntryStore {
    chain: SegmentChain,
    index: HashMap<String, Slot>,
    free: Vec<(Address, u32)>,
    generation: Option<u64>,
    corrupt_skipped: usize,
}

impl EntryStore {
    pub fn new(chain: SegmentChain) -> Self {
        Self {
            chain,
            index: HashMap::new(),
            free: Vec::new(),
            generation: None,
            corrupt_skipped: 0,
        }
    }

    pub fn chain(&self) -> &SegmentChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut SegmentChain {
        &mut self.chain
    }

    pub fn into_chain(self) -> SegmentChain {
        self.chain
    }

    /// Records skipped during the most recent rebuild because their headers
    /// could not be trusted.
    pub fn corrupt_skipped(&self) -> usize {
        self.corrupt_skipped
    }

    /// Maps new segments and rebuilds the index if another handle changed the
    /// layout. `writable` allows evicting malformed or duplicate records.
    pub fn sync(&mut self, writable: bool) -> Result<(), Error> {
        self.chain.refresh()?;
        let current = self.chain.generation();
        if self.generation == Some(current) {
            return Ok(());
        }
        self.rebuild(writable)?;
        Ok(())
    }

    fn rebuild(&mut self, writable: bool) -> Result<(), Error> {
        self.index.clear();
        self.free.clear();
        self.corrupt_skipped = 0;
        let mut evict = Vec::new();

        for segment in self.chain.segment_ids().collect::<Vec<_>>() {
            let bump = self.chain.bump(segment);
            let mut offset = SEGMENT_HEADER_LEN as u64;
            while offset + ENTRY_HEADER_LEN as u64 <= bump {
                let addr = Address { segment, offset };
                let Some(header) = self.header_at(addr, bump) else {
                    // Resume at the next record that checks out. A writer turns
                    // the gap into a dead slot so later walks, and every write
                    // placed after it, stay reachable.
                    let resume = self.resync(segment, offset, bump);
                    warn!(
                        dir = %self.chain.dir().display(),
                        segment,
                        offset,
                        skipped = resume - offset,
                        "skipping unreadable record"
                    );
                    self.corrupt_skipped += 1;
                    match u32::try_from(resume - offset) {
                        Ok(gap) => evict.push((addr, gap)),
                        Err(_) => warn!(segment, offset, "unreadable run too long to fence"),
                    }
                    offset = resume;
                    continue;
                };

                match header.state {
                    EntryState::Dead => self.free.push((addr, header.slot_len)),
                    EntryState::Live => match self.read_key(addr, &header) {
                        Ok(key) => {
                            let slot = Slot {
                                addr,
                                slot_len: header.slot_len,
                                version: header.version,
                                expires_at_ms: header.expires_at_ms,
                            };
                            match self.index.get(&key) {
                                Some(existing) if existing.version >= slot.version => {
                                    evict.push((addr, header.slot_len));
                                }
                                Some(existing) => {
                                    evict.push((existing.addr, existing.slot_len));
                                    self.index.insert(key, slot);
                                }
                                None => {
                                    self.index.insert(key, slot);
                                }
                            }
                        }
                        Err(err) => {
                            warn!(segment, offset, error = %err, "evicting record with unreadable key");
                            self.corrupt_skipped += 1;
                            evict.push((addr, header.slot_len));
                        }
                    },
                }
                offset += header.slot_len as u64;
            }
        }

        if writable && !evict.is_empty() {
            for (addr, slot_len) in evict {
                self.retire_slot(addr, slot_len)?;
            }
            self.chain.bump_generation();
        }
        self.generation = Some(self.chain.generation());
        Ok(())
    }

    fn header_at(&self, addr: Address, bump: u64) -> Option<EntryHeader> {
        let header = self
            .chain
            .read(addr, ENTRY_HEADER_LEN)
            .and_then(EntryHeader::decode)
            .ok()?;
        (addr.offset + header.slot_len as u64 <= bump).then_some(header)
    }

    /// First 8-aligned offset after `offset` holding a well-formed record whose
    /// body, if live, matches its checksum; `bump` when there is none.
    fn resync(&self, segment: u32, offset: u64, bump: u64) -> u64 {
        let mut candidate = offset + ENTRY_HEADER_LEN as u64;
        while candidate + ENTRY_HEADER_LEN as u64 <= bump {
            let addr = Address {
                segment,
                offset: candidate,
            };
            if let Some(header) = self.header_at(addr, bump) {
                if header.state == EntryState::Dead || self.body_checks_out(addr, &header) {
                    return candidate;
                }
            }
            candidate += 8;
        }
        bump
    }

    fn body_checks_out(&self, addr: Address, header: &EntryHeader) -> bool {
        self.chain
            .read(body_addr(addr), header.key_len as usize + header.payload_len as usize)
            .is_ok_and(|body| crc32(body) == header.checksum)
    }

    fn read_key(&self, addr: Address, header: &EntryHeader) -> Result<String, Error> {
        let raw = self.chain.read(body_addr(addr), header.key_len as usize)?;
        String::from_utf8(raw.to_vec()).map_err(|_| corrupt("entry key is not utf-8"))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Keys whose entries have not expired at `now_ms`.
    pub fn live_keys(&self, now_ms: u64) -> Vec<String> {
        self.index
            .iter()
            .filter(|(_, slot)| slot.expires_at_ms == 0 || now_ms < slot.expires_at_ms)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Indexed and not expired at `now_ms`.
    pub fn is_live(&self, key: &str, now_ms: u64) -> bool {
        self.index
            .get(key)
            .is_some_and(|slot| slot.expires_at_ms == 0 || now_ms < slot.expires_at_ms)
    }

    pub fn get(&self, key: &str) -> Result<Option<RawEntry>, Error> {
        let Some(slot) = self.index.get(key) else {
            return Ok(None);
        };
        let header = EntryHeader::decode(self.chain.read(slot.addr, ENTRY_HEADER_LEN)?)
            .map_err(|err| err.with_key(key))?;
        if header.state != EntryState::Live || header.version != slot.version {
            return Err(corrupt("index points at a stale slot").with_key(key));
        }
        let tag = TypeTag::from_u8(header.tag)
            .map_err(|_| corrupt("invalid type tag").with_key(key))?;
        let key_len = header.key_len as usize;
        let body = self
            .chain
            .read(body_addr(slot.addr), key_len + header.payload_len as usize)
            .map_err(|err| err.with_key(key))?;
        if crc32(body) != header.checksum {
            return Err(corrupt("entry body checksum mismatch").with_key(key));
        }
        let payload = body[key_len..].to_vec();
        Ok(Some(RawEntry {
            key: key.to_string(),
            tag,
            flags: header.flags,
            expires_at_ms: header.expires_at_ms,
            version: header.version,
            payload,
        }))
    }

    /// Writes or replaces `key`, returning the version assigned to the write.
    pub fn put(
        &mut self,
        key: &str,
        tag: TypeTag,
        flags: u32,
        payload: &[u8],
        expires_at_ms: u64,
    ) -> Result<u64, Error> {
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            Error::new(ErrorKind::CapacityExceeded).with_message("payload exceeds 4 GiB")
        })?;
        let key_len = u32::try_from(key.len())
            .map_err(|_| Error::new(ErrorKind::Usage).with_message("key too long"))?;
        let needed = slot_len_for(key.len(), payload.len());
        if needed as u64 > self.chain.max_capacity() {
            return Err(Error::new(ErrorKind::CapacityExceeded)
                .with_message(format!(
                    "entry of {needed} bytes exceeds max capacity {}",
                    self.chain.max_capacity()
                )));
        }
        let existing = self.index.get(key).copied();

        let (addr, slot_len, relocated) = match existing {
            Some(slot) if slot.slot_len as usize >= needed => (slot.addr, slot.slot_len, false),
            _ => {
                let (addr, slot_len) = self.allocate(needed)?;
                (addr, slot_len, true)
            }
        };

        let mut body = Vec::with_capacity(key.len() + payload.len());
        body.extend_from_slice(key.as_bytes());
        body.extend_from_slice(payload);

        let version = self.chain.next_version();
        let header = EntryHeader {
            state: EntryState::Live,
            tag: tag as u8,
            flags,
            key_len,
            payload_len,
            slot_len,
            expires_at_ms,
            version,
            written_ms: now_ms(),
            checksum: crc32(&body),
        };
        self.chain.write(body_addr(addr), &body)?;
        self.chain.write(addr, &header.encode())?;

        if relocated {
            if let Some(old) = existing {
                self.retire_slot(old.addr, old.slot_len)?;
            }
        }
        self.index.insert(
            key.to_string(),
            Slot {
                addr,
                slot_len,
                version,
                expires_at_ms,
            },
        );
        self.generation = Some(self.chain.bump_generation());
        Ok(version)
    }

    pub fn remove(&mut self, key: &str) -> Result<bool, Error> {
        let Some(slot) = self.index.remove(key) else {
            return Ok(false);
        };
        self.retire_slot(slot.addr, slot.slot_len)?;
        self.generation = Some(self.chain.bump_generation());
        Ok(true)
    }

    /// Removes every entry whose expiry is at or before `now_ms`.
    pub fn purge_expired(&mut self, now_ms: u64) -> Result<usize, Error> {
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|(_, slot)| slot.expires_at_ms != 0 && now_ms >= slot.expires_at_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(slot) = self.index.remove(key) {
                self.retire_slot(slot.addr, slot.slot_len)?;
            }
        }
        if !expired.is_empty() {
            self.generation = Some(self.chain.bump_generation());
        }
        Ok(expired.len())
    }

    /// Coalesces adjacent dead slots and returns trailing dead space to each
    /// segment's bump pointer. Live entries never move.
    pub fn compact(&mut self) -> Result<u64, Error> {
        let mut reclaimed = 0u64;
        for segment in self.chain.segment_ids().collect::<Vec<_>>() {
            let bump = self.chain.bump(segment);
            let mut offset = SEGMENT_HEADER_LEN as u64;
            let mut run: Option<(u64, u64)> = None;
            while offset + ENTRY_HEADER_LEN as u64 <= bump {
                let addr = Address { segment, offset };
                let header = match self.chain.read(addr, ENTRY_HEADER_LEN).and_then(EntryHeader::decode) {
                    Ok(header) if offset + header.slot_len as u64 <= bump => header,
                    _ => {
                        run = None;
                        break;
                    }
                };
                if header.state == EntryState::Dead {
                    run = match run {
                        Some((start, len)) => Some((start, len + header.slot_len as u64)),
                        None => Some((offset, header.slot_len as u64)),
                    };
                } else if let Some((start, len)) = run.take() {
                    self.write_dead(Address { segment, offset: start }, len)?;
                }
                offset += header.slot_len as u64;
            }
            if let Some((start, len)) = run {
                if start + len == bump {
                    self.chain.set_bump(segment, start);
                    self.chain.adjust_counters(segment, 0, -(len as i64));
                    reclaimed += len;
                } else {
                    self.write_dead(Address { segment, offset: start }, len)?;
                }
            }
        }
        self.chain.bump_generation();
        self.generation = None;
        self.sync(true)?;
        Ok(reclaimed)
    }

    fn write_dead(&mut self, addr: Address, len: u64) -> Result<(), Error> {
        let slot_len = u32::try_from(len).map_err(|_| corrupt("dead run exceeds slot width"))?;
        self.chain.write(addr, &EntryHeader::dead(slot_len).encode())
    }

    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            used_bytes: self.chain.live_bytes(),
            dead_bytes: self.chain.dead_bytes(),
            capacity_bytes: self.chain.capacity(),
            max_bytes: self.chain.max_capacity(),
            segment_count: self.chain.segment_count(),
        }
    }

    fn allocate(&mut self, needed: usize) -> Result<(Address, u32), Error> {
        if let Some(found) = self.take_free(needed)? {
            return Ok(found);
        }
        let len = needed as u64;
        let addr = match self.chain.bump_alloc(len) {
            Some(addr) => addr,
            None => {
                self.chain.grow(len)?;
                self.chain.bump_alloc(len).ok_or_else(|| {
                    Error::new(ErrorKind::Internal).with_message("new segment cannot hold entry")
                })?
            }
        };
        self.chain.adjust_counters(addr.segment, len as i64, 0);
        Ok((addr, needed as u32))
    }

    /// First-fit over dead slots, splitting off the remainder when it can hold
    /// a header of its own.
    fn take_free(&mut self, needed: usize) -> Result<Option<(Address, u32)>, Error> {
        let Some(pos) = self
            .free
            .iter()
            .position(|(_, slot_len)| *slot_len as usize >= needed)
        else {
            return Ok(None);
        };
        let (addr, slot_len) = self.free.swap_remove(pos);
        let remainder = slot_len as usize - needed;
        let used = if remainder >= ENTRY_HEADER_LEN {
            let rest = Address {
                segment: addr.segment,
                offset: addr.offset + needed as u64,
            };
            self.chain
                .write(rest, &EntryHeader::dead(remainder as u32).encode())?;
            self.free.push((rest, remainder as u32));
            needed as u32
        } else {
            slot_len
        };
        self.chain
            .adjust_counters(addr.segment, used as i64, -(used as i64));
        Ok(Some((addr, used)))
    }

    fn retire_slot(&mut self, addr: Address, slot_len: u32) -> Result<(), Error> {
        self.chain
            .write(addr, &EntryHeader::dead(slot_len).encode())?;
        self.chain
            .adjust_counters(addr.segment, -(slot_len as i64), slot_len as i64);
        self.free.push((addr, slot_len));
        Ok(())
    }
}

fn body_addr(addr: Address) -> Address {
    Address {
        segment: addr.segment,
        offset: addr.offset + ENTRY_HEADER_LEN as u64,
    }
}

fn corrupt(message: &str) -> Error {
    Error::new(ErrorKind::CorruptedRecord).with_message(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::{ENTRY_HEADER_LEN, EntryHeader, EntryState, EntryStore, slot_len_for};
    use crate::core::codec::TypeTag;
    use crate::core::error::ErrorKind;
    use crate::core::segment::{SEGMENT_HEADER_LEN, SegmentChain};

    const GRANULE: u64 = 4096;

    fn store(dir: &std::path::Path, max: u64) -> EntryStore {
        let chain = SegmentChain::allocate_pool(dir.join("p"), GRANULE, GRANULE, max)
            .expect("allocate");
        let mut store = EntryStore::new(chain);
        store.sync(true).expect("sync");
        store
    }

    #[test]
    fn header_round_trip_and_torn_length() {
        let header = EntryHeader {
            state: EntryState::Live,
            tag: TypeTag::Text as u8,
            flags: 0,
            key_len: 3,
            payload_len: 5,
            slot_len: 64,
            expires_at_ms: 0,
            version: 9,
            written_ms: 1,
            checksum: 0xDEAD_BEEF,
        };
        let mut buf = header.encode();
        assert_eq!(EntryHeader::decode(&buf).expect("decode"), header);
        buf[20] ^= 0xFF;
        assert_eq!(
            EntryHeader::decode(&buf).expect_err("torn").kind(),
            ErrorKind::CorruptedRecord
        );
    }

    #[test]
    fn put_get_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store(dir.path(), 16 * GRANULE);
        let v1 = store.put("a", TypeTag::Text, 0, b"\0one", 0).expect("put");
        let v2 = store.put("a", TypeTag::Text, 0, b"\0two", 0).expect("put again");
        assert!(v2 > v1);

        let entry = store.get("a").expect("get").expect("present");
        assert_eq!(entry.payload, b"\0two");
        assert_eq!(entry.version, v2);
        assert!(store.remove("a").expect("remove"));
        assert!(store.get("a").expect("get").is_none());
        assert!(!store.remove("a").expect("remove twice"));
    }

    #[test]
    fn small_rewrite_stays_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store(dir.path(), 16 * GRANULE);
        store.put("k", TypeTag::Bytes, 0, &[1u8; 64], 0).expect("put");
        let bump = store.chain().bump(0);
        store.put("k", TypeTag::Bytes, 0, &[2u8; 16], 0).expect("shrink");
        assert_eq!(store.chain().bump(0), bump);
        assert_eq!(store.usage().dead_bytes, 0);
    }

    #[test]
    fn dead_slots_are_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store(dir.path(), 16 * GRANULE);
        store.put("big", TypeTag::Bytes, 0, &[0u8; 512], 0).expect("put");
        store.remove("big").expect("remove");
        let bump = store.chain().bump(0);
        store.put("small", TypeTag::Bytes, 0, &[0u8; 100], 0).expect("reuse");
        assert_eq!(store.chain().bump(0), bump);
        assert!(store.usage().dead_bytes > 0);
    }

    #[test]
    fn growth_then_capacity_exceeded_keeps_existing_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store(dir.path(), 3 * GRANULE);
        for i in 0..5 {
            store
                .put(&format!("k{i}"), TypeTag::Bytes, 0, &[i as u8; 1500], 0)
                .expect("fits after growth");
        }
        assert!(store.usage().segment_count > 1);
        let err = store
            .put("overflow", TypeTag::Bytes, 0, &[9u8; 2 * GRANULE as usize], 0)
            .expect_err("over max");
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        for i in 0..5 {
            let entry = store.get(&format!("k{i}")).expect("get").expect("present");
            assert_eq!(entry.payload, vec![i as u8; 1500]);
        }
    }

    #[test]
    fn second_store_rebuilds_after_generation_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = store(dir.path(), 16 * GRANULE);
        let mut reader = EntryStore::new(SegmentChain::open(dir.path().join("p")).expect("open"));
        reader.sync(false).expect("sync");
        assert!(reader.is_empty());

        writer.put("x", TypeTag::Int, 0, &[0u8; 9], 0).expect("put");
        reader.sync(false).expect("sync");
        assert!(reader.contains("x"));
    }

    #[test]
    fn purge_and_compact_reclaim_space() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store(dir.path(), 16 * GRANULE);
        store.put("keep", TypeTag::Bytes, 0, &[1u8; 10], 0).expect("put");
        store.put("gone1", TypeTag::Bytes, 0, &[1u8; 10], 5).expect("put");
        store.put("gone2", TypeTag::Bytes, 0, &[1u8; 10], 5).expect("put");
        assert_eq!(store.purge_expired(10).expect("purge"), 2);
        assert_eq!(store.len(), 1);

        let reclaimed = store.compact().expect("compact");
        assert_eq!(reclaimed, 2 * slot_len_for(5, 10) as u64);
        assert_eq!(
            store.chain().bump(0),
            SEGMENT_HEADER_LEN as u64 + slot_len_for(4, 10) as u64
        );
        assert!(store.get("keep").expect("get").is_some());
    }

    #[test]
    fn corrupt_record_is_isolated_to_its_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store(dir.path(), 16 * GRANULE);
        store.put("first", TypeTag::Bytes, 0, &[1u8; 3000], 0).expect("put");
        store.put("second", TypeTag::Bytes, 0, &[2u8; 3000], 0).expect("put in new segment");
        assert_eq!(store.usage().segment_count, 2);

        let addr = crate::core::segment::Address {
            segment: 0,
            offset: SEGMENT_HEADER_LEN as u64,
        };
        store.chain_mut().write(addr, &[0xAB; ENTRY_HEADER_LEN]).expect("scribble");
        store.chain_mut().bump_generation();
        store.sync(true).expect("sync survives corruption");
        assert_eq!(store.corrupt_skipped(), 1);
        assert!(!store.contains("first"));
        assert!(store.get("second").expect("get").is_some());
    }

    #[test]
    fn records_after_a_bad_header_stay_reachable_for_every_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = store(dir.path(), 16 * GRANULE);
        writer.put("first", TypeTag::Bytes, 0, &[1u8; 100], 0).expect("put");
        writer.put("second", TypeTag::Bytes, 0, &[2u8; 100], 0).expect("put");

        let addr = crate::core::segment::Address {
            segment: 0,
            offset: SEGMENT_HEADER_LEN as u64,
        };
        writer.chain_mut().write(addr, &[0xAB; ENTRY_HEADER_LEN]).expect("scribble");
        writer.chain_mut().bump_generation();
        writer.sync(true).expect("sync survives corruption");
        assert_eq!(writer.corrupt_skipped(), 1);
        assert!(!writer.contains("first"));
        assert_eq!(writer.get("second").expect("get").expect("present").payload, vec![2u8; 100]);

        writer.put("third", TypeTag::Bytes, 0, &[3u8; 100], 0).expect("put after corruption");

        let mut reader = EntryStore::new(SegmentChain::open(dir.path().join("p")).expect("open"));
        reader.sync(false).expect("sync");
        assert_eq!(reader.corrupt_skipped(), 0);
        assert_eq!(reader.get("second").expect("get").expect("present").payload, vec![2u8; 100]);
        assert_eq!(reader.get("third").expect("get").expect("present").payload, vec![3u8; 100]);
    }

    #[test]
    fn unreadable_tail_is_fenced_before_new_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = store(dir.path(), 16 * GRANULE);
        writer.put("only", TypeTag::Bytes, 0, &[1u8; 64], 0).expect("put");
        let addr = crate::core::segment::Address {
            segment: 0,
            offset: SEGMENT_HEADER_LEN as u64,
        };
        writer.chain_mut().write(addr, &[0u8; ENTRY_HEADER_LEN]).expect("zero header");
        writer.chain_mut().bump_generation();
        writer.sync(true).expect("sync");

        writer.put("later", TypeTag::Bytes, 0, &[5u8; 300], 0).expect("put");
        let mut reader = EntryStore::new(SegmentChain::open(dir.path().join("p")).expect("open"));
        reader.sync(false).expect("sync");
        assert!(!reader.contains("only"));
        assert_eq!(reader.get("later").expect("get").expect("present").payload, vec![5u8; 300]);
    }

    #[test]
    fn torn_rewrite_fails_only_its_own_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store(dir.path(), 16 * GRANULE);
        store.put("k", TypeTag::Bytes, 0, &[1u8; 64], 0).expect("put");
        store.put("other", TypeTag::Bytes, 0, &[9u8; 8], 0).expect("put");

        // New body over the old header, as if the writer died between the two.
        let body = crate::core::segment::Address {
            segment: 0,
            offset: (SEGMENT_HEADER_LEN + ENTRY_HEADER_LEN + 1) as u64,
        };
        store.chain_mut().write(body, &[2u8; 32]).expect("half write");

        let err = store.get("k").expect_err("torn body");
        assert_eq!(err.kind(), ErrorKind::CorruptedRecord);
        assert_eq!(err.key(), Some("k"));
        assert!(store.get("other").expect("get").is_some());

        store.put("k", TypeTag::Bytes, 0, &[3u8; 64], 0).expect("rewrite heals");
        assert_eq!(store.get("k").expect("get").expect("present").payload, vec![3u8; 64]);
    }
}
