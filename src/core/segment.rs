//! Purpose: Own the chain of mapped segment files that backs one pool.
//! Exports: `SegmentChain`, `Address`, `SEGMENT_HEADER_LEN`, `DEFAULT_SEGMENT_SIZE`.
//! Role: Raw growable storage; entry layout and slot reuse live in `store`.
//! Invariants: Segments are never resized or remapped once created; growth appends a segment.
//! Invariants: Total capacity never exceeds the chain's configured maximum.
//! Invariants: Callers hold the owning pool's lock for every mutation.
//!
//! Segment 0 additionally carries the chain header (segment count, generation,
//! write sequence, retired flag, growth policy), so a process that opens the
//! pool can discover segments appended by other processes.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::debug;

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::layout::{read_u32, read_u64, round_up, write_u32, write_u64};

pub const SEGMENT_HEADER_LEN: usize = 128;
pub const DEFAULT_SEGMENT_SIZE: u64 = 1024 * 1024;
pub const LOCK_FILE: &str = "lock";

const SEGMENT_MAGIC: [u8; 4] = *b"LZSG";
const SEGMENT_VERSION: u32 = 1;
const NO_NEXT: u32 = u32::MAX;

// Per-segment fields.
const OFF_ID: usize = 8;
const OFF_NEXT: usize = 12;
const OFF_SIZE: usize = 16;
const OFF_BUMP: usize = 24;
const OFF_LIVE: usize = 32;
const OFF_DEAD: usize = 40;
// Chain header, meaningful in segment 0 only.
const OFF_SEGMENT_COUNT: usize = 64;
const OFF_RETIRED: usize = 68;
const OFF_GENERATION: usize = 72;
const OFF_WRITE_SEQ: usize = 80;
const OFF_GRANULARITY: usize = 88;
const OFF_MAX_CAPACITY: usize = 96;

/// Stable location of a slot: segment id plus byte offset inside that segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub segment: u32,
    pub offset: u64,
}

struct Segment {
    path: PathBuf,
    // Keeps the descriptor alive for the mapping's lifetime.
    _file: File,
    mmap: MmapMut,
}

impl Segment {
    fn create(path: PathBuf, id: u32, size: u64) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(err, &path))?;
        file.set_len(size).map_err(|err| io_error(err, &path))?;
        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|err| io_error(err, &path))? };

        let header = &mut mmap[..SEGMENT_HEADER_LEN];
        header.fill(0);
        header[0..4].copy_from_slice(&SEGMENT_MAGIC);
        write_u32(header, 4, SEGMENT_VERSION);
        write_u32(header, OFF_ID, id);
        write_u32(header, OFF_NEXT, NO_NEXT);
        write_u64(header, OFF_SIZE, size);
        write_u64(header, OFF_BUMP, SEGMENT_HEADER_LEN as u64);

        Ok(Self {
            path,
            _file: file,
            mmap,
        })
    }

    fn open(path: PathBuf, expected_id: u32) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Error::new(ErrorKind::PoolNotFound)
                        .with_message("segment file missing")
                        .with_path(&path)
                } else {
                    io_error(err, &path)
                }
            })?;
        let actual = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| io_error(err, &path))?;
        if actual < SEGMENT_HEADER_LEN as u64 {
            return Err(corrupt("segment smaller than header").with_path(&path));
        }
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|err| io_error(err, &path))? };
        let segment = Self {
            path,
            _file: file,
            mmap,
        };
        segment.validate(expected_id, actual)?;
        Ok(segment)
    }

    fn validate(&self, expected_id: u32, actual_len: u64) -> Result<(), Error> {
        let header = &self.mmap[..SEGMENT_HEADER_LEN];
        if header[0..4] != SEGMENT_MAGIC {
            return Err(corrupt("bad segment magic").with_path(&self.path));
        }
        if read_u32(header, 4) != SEGMENT_VERSION {
            return Err(corrupt("unsupported segment version").with_path(&self.path));
        }
        if read_u32(header, OFF_ID) != expected_id {
            return Err(corrupt("segment id mismatch").with_path(&self.path));
        }
        let size = self.size();
        if size != actual_len {
            return Err(corrupt("segment size mismatch").with_path(&self.path));
        }
        let bump = self.bump();
        if bump < SEGMENT_HEADER_LEN as u64 || bump > size {
            return Err(corrupt("segment bump out of range").with_path(&self.path));
        }
        Ok(())
    }

    fn get(&self, offset: usize) -> u64 {
        read_u64(&self.mmap, offset)
    }

    fn put(&mut self, offset: usize, value: u64) {
        write_u64(&mut self.mmap, offset, value);
    }

    fn size(&self) -> u64 {
        self.get(OFF_SIZE)
    }

    fn bump(&self) -> u64 {
        self.get(OFF_BUMP)
    }

    fn next(&self) -> u32 {
        read_u32(&self.mmap, OFF_NEXT)
    }
}

/// A pool's segments, mapped in chain order.
pub struct SegmentChain {
    dir: PathBuf,
    segments: Vec<Segment>,
}

impl SegmentChain {
    /// Creates the pool directory, its lock file, and segment 0.
    pub fn allocate_pool(
        dir: impl AsRef<Path>,
        initial_capacity: u64,
        granularity: u64,
        max_capacity: u64,
    ) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        if granularity < 2 * SEGMENT_HEADER_LEN as u64 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("segment size must be at least 256 bytes"));
        }
        let size = round_up(initial_capacity.max(1), granularity);
        if size > max_capacity {
            return Err(Error::new(ErrorKind::CapacityExceeded)
                .with_message("initial capacity exceeds max capacity"));
        }

        fs::create_dir_all(&dir).map_err(|err| io_error(err, &dir))?;
        let lock_path = dir.join(LOCK_FILE);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|err| io_error(err, &lock_path))?;

        let mut first = Segment::create(segment_path(&dir, 0), 0, size)?;
        write_u32(&mut first.mmap, OFF_SEGMENT_COUNT, 1);
        first.put(OFF_GRANULARITY, granularity);
        first.put(OFF_MAX_CAPACITY, max_capacity);
        first
            .mmap
            .flush()
            .map_err(|err| io_error(err, &first.path))?;

        debug!(dir = %dir.display(), size, "allocated pool segment chain");
        Ok(Self {
            dir,
            segments: vec![first],
        })
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        let first = Segment::open(segment_path(&dir, 0), 0)?;
        let mut chain = Self {
            dir,
            segments: vec![first],
        };
        chain.refresh()?;
        Ok(chain)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Maps segments appended by other processes since the last call.
    pub fn refresh(&mut self) -> Result<(), Error> {
        let count = self.chain_segment_count() as usize;
        while self.segments.len() < count {
            let id = self.segments.len() as u32;
            let expected_next = self.segments[self.segments.len() - 1].next();
            if expected_next != id {
                return Err(corrupt("segment chain link mismatch").with_path(&self.dir));
            }
            let segment = Segment::open(segment_path(&self.dir, id), id)?;
            self.segments.push(segment);
        }
        Ok(())
    }

    fn first(&self) -> &Segment {
        &self.segments[0]
    }

    fn first_mut(&mut self) -> &mut Segment {
        &mut self.segments[0]
    }

    fn chain_segment_count(&self) -> u32 {
        read_u32(&self.first().mmap, OFF_SEGMENT_COUNT)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn generation(&self) -> u64 {
        self.first().get(OFF_GENERATION)
    }

    /// Marks that entry layout changed; other processes rebuild their index.
    pub fn bump_generation(&mut self) -> u64 {
        let next = self.generation().wrapping_add(1);
        self.first_mut().put(OFF_GENERATION, next);
        next
    }

    /// Pool-wide write sequence; every write takes the next value as its version.
    pub fn next_version(&mut self) -> u64 {
        let next = self.first().get(OFF_WRITE_SEQ) + 1;
        self.first_mut().put(OFF_WRITE_SEQ, next);
        next
    }

    pub fn is_retired(&self) -> bool {
        read_u32(&self.first().mmap, OFF_RETIRED) != 0
    }

    pub fn retire(&mut self) {
        write_u32(&mut self.first_mut().mmap, OFF_RETIRED, 1);
    }

    pub fn granularity(&self) -> u64 {
        self.first().get(OFF_GRANULARITY)
    }

    pub fn max_capacity(&self) -> u64 {
        self.first().get(OFF_MAX_CAPACITY)
    }

    pub fn set_max_capacity(&mut self, max_capacity: u64) {
        self.first_mut().put(OFF_MAX_CAPACITY, max_capacity);
    }

    pub fn capacity(&self) -> u64 {
        self.segments.iter().map(Segment::size).sum()
    }

    pub fn live_bytes(&self) -> u64 {
        self.segments.iter().map(|segment| segment.get(OFF_LIVE)).sum()
    }

    pub fn dead_bytes(&self) -> u64 {
        self.segments.iter().map(|segment| segment.get(OFF_DEAD)).sum()
    }

    /// Bytes not yet handed out by any segment's bump pointer.
    pub fn free_space(&self) -> u64 {
        self.segments
            .iter()
            .map(|segment| segment.size() - segment.bump())
            .sum()
    }

    pub fn segment_ids(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.segments.len()).map(|id| id as u32)
    }

    /// Offset one past the last allocated byte of `segment`.
    pub fn bump(&self, segment: u32) -> u64 {
        self.segments[segment as usize].bump()
    }

    pub fn set_bump(&mut self, segment: u32, bump: u64) {
        self.segments[segment as usize].put(OFF_BUMP, bump);
    }

    pub fn adjust_counters(&mut self, segment: u32, live_delta: i64, dead_delta: i64) {
        let seg = &mut self.segments[segment as usize];
        let live = seg.get(OFF_LIVE).saturating_add_signed(live_delta);
        let dead = seg.get(OFF_DEAD).saturating_add_signed(dead_delta);
        seg.put(OFF_LIVE, live);
        seg.put(OFF_DEAD, dead);
    }

    /// Hands out `len` bytes from the first segment with enough untouched room.
    pub fn bump_alloc(&mut self, len: u64) -> Option<Address> {
        for (id, segment) in self.segments.iter_mut().enumerate() {
            let bump = segment.bump();
            if segment.size() - bump >= len {
                segment.put(OFF_BUMP, bump + len);
                return Some(Address {
                    segment: id as u32,
                    offset: bump,
                });
            }
        }
        None
    }

    /// Appends one segment of at least `additional` usable bytes, rounded up to
    /// the chain's granularity.
    pub fn grow(&mut self, additional: u64) -> Result<(), Error> {
        let granularity = self.granularity();
        let size = round_up(additional + SEGMENT_HEADER_LEN as u64, granularity);
        let capacity = self.capacity();
        let max = self.max_capacity();
        if capacity.saturating_add(size) > max {
            return Err(Error::new(ErrorKind::CapacityExceeded).with_message(format!(
                "growing by {size} bytes would exceed max capacity {max} (current {capacity})"
            )));
        }

        let id = self.segments.len() as u32;
        let segment = Segment::create(segment_path(&self.dir, id), id, size)?;
        let last = self.segments.len() - 1;
        write_u32(&mut self.segments[last].mmap, OFF_NEXT, id);
        self.segments.push(segment);
        write_u32(&mut self.first_mut().mmap, OFF_SEGMENT_COUNT, id + 1);
        debug!(dir = %self.dir.display(), segment = id, size, "grew segment chain");
        Ok(())
    }

    pub fn read(&self, addr: Address, len: usize) -> Result<&[u8], Error> {
        let segment = self.segment(addr)?;
        let start = addr.offset as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end as u64 <= segment.bump())
            .ok_or_else(|| corrupt("read past allocated region"))?;
        Ok(&segment.mmap[start..end])
    }

    pub fn write(&mut self, addr: Address, bytes: &[u8]) -> Result<(), Error> {
        let segment = self
            .segments
            .get_mut(addr.segment as usize)
            .ok_or_else(|| corrupt("unknown segment"))?;
        let start = addr.offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end as u64 <= segment.bump())
            .ok_or_else(|| corrupt("write past allocated region"))?;
        segment.mmap[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn segment(&self, addr: Address) -> Result<&Segment, Error> {
        self.segments
            .get(addr.segment as usize)
            .ok_or_else(|| corrupt("unknown segment"))
    }

    pub fn flush(&self) -> Result<(), Error> {
        for segment in &self.segments {
            segment
                .mmap
                .flush_async()
                .map_err(|err| io_error(err, &segment.path))?;
        }
        Ok(())
    }

    /// Unmaps every segment and deletes the pool directory.
    pub fn release(self) -> Result<(), Error> {
        let dir = self.dir.clone();
        drop(self);
        release_dir(&dir)
    }
}

pub fn release_dir(dir: &Path) -> Result<(), Error> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error(err, dir)),
    }
}

pub(crate) fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("seg-{id:05}.lzs"))
}

fn corrupt(message: &str) -> Error {
    Error::new(ErrorKind::CorruptedRecord).with_message(message.to_string())
}
