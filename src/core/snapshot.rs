// Disk snapshots of a pool's live entries for warm restart.
//
// File layout: magic `LZSN`, version u32, entry count u32, then per entry
// key_len u32, tag u8, flags u32, expires_at_ms u64, payload_len u32, key,
// payload; a SHA-256 of everything before it closes the file. Payloads are
// written exactly as stored, so sealed entries stay sealed on disk.
use std::fs;
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::codec::TypeTag;
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::layout::{read_u32, read_u64};
use crate::core::pool::PoolHandle;
use crate::core::store::RawEntry;

const MAGIC: [u8; 4] = *b"LZSN";
const VERSION: u32 = 1;
const DIGEST_LEN: usize = 32;

/// Writes every live, unexpired entry of `handle` to `path`. Returns the
/// number of entries written.
pub fn write_snapshot(handle: &PoolHandle, path: impl AsRef<Path>) -> Result<usize, Error> {
    let path = path.as_ref();
    let entries = handle.raw_entries()?;
    let bytes = encode(&entries)?;

    let tmp = path.with_extension("lzsn.tmp");
    let mut file = fs::File::create(&tmp).map_err(|err| io_error(err, &tmp))?;
    file.write_all(&bytes).map_err(|err| io_error(err, &tmp))?;
    file.sync_all().map_err(|err| io_error(err, &tmp))?;
    fs::rename(&tmp, path).map_err(|err| io_error(err, path))?;
    debug!(pool = handle.name(), entries = entries.len(), path = %path.display(), "wrote snapshot");
    Ok(entries.len())
}

/// Re-inserts a snapshot's entries into `handle` with fresh versions,
/// skipping any that expired since it was written.
pub fn restore_snapshot(handle: &PoolHandle, path: impl AsRef<Path>) -> Result<usize, Error> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|err| io_error(err, path))?;
    let entries = decode(&bytes).map_err(|err| err.with_path(path))?;
    let restored = handle.put_raw(&entries)?;
    debug!(pool = handle.name(), restored, path = %path.display(), "restored snapshot");
    Ok(restored)
}

fn encode(entries: &[RawEntry]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&len_u32(entries.len())?.to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&len_u32(entry.key.len())?.to_le_bytes());
        out.push(entry.tag as u8);
        out.extend_from_slice(&entry.flags.to_le_bytes());
        out.extend_from_slice(&entry.expires_at_ms.to_le_bytes());
        out.extend_from_slice(&len_u32(entry.payload.len())?.to_le_bytes());
        out.extend_from_slice(entry.key.as_bytes());
        out.extend_from_slice(&entry.payload);
    }
    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<Vec<RawEntry>, Error> {
    if bytes.len() < 12 + DIGEST_LEN {
        return Err(corrupt("snapshot truncated"));
    }
    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
    if Sha256::digest(body).as_slice() != digest {
        return Err(corrupt("snapshot checksum mismatch"));
    }
    if body[0..4] != MAGIC {
        return Err(corrupt("bad snapshot magic"));
    }
    if read_u32(body, 4) != VERSION {
        return Err(corrupt("unsupported snapshot version"));
    }
    let count = read_u32(body, 8) as usize;
    let mut pos = 12;
    let mut entries = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let fixed = take(body, &mut pos, 21)?;
        let key_len = read_u32(fixed, 0) as usize;
        let tag = TypeTag::from_u8(fixed[4]).map_err(|_| corrupt("invalid type tag in snapshot"))?;
        let flags = read_u32(fixed, 5);
        let expires_at_ms = read_u64(fixed, 9);
        let payload_len = read_u32(fixed, 17) as usize;
        let key = std::str::from_utf8(take(body, &mut pos, key_len)?)
            .map_err(|_| corrupt("snapshot key is not utf-8"))?
            .to_string();
        let payload = take(body, &mut pos, payload_len)?.to_vec();
        entries.push(RawEntry {
            key,
            tag,
            flags,
            expires_at_ms,
            version: 0,
            payload,
        });
    }
    if pos != body.len() {
        return Err(corrupt("trailing bytes in snapshot"));
    }
    Ok(entries)
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], Error> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| corrupt("snapshot entry truncated"))?;
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

fn len_u32(len: usize) -> Result<u32, Error> {
    u32::try_from(len)
        .map_err(|_| Error::new(ErrorKind::Serialization).with_message("snapshot field exceeds u32"))
}

fn corrupt(message: &str) -> Error {
    Error::new(ErrorKind::CorruptedRecord).with_message(message.to_string())
}
