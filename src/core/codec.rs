//! Purpose: Tagged binary encoding of pool values with optional compression.
//! Exports: `Value`, `TypeTag`, `Codec`, `DEFAULT_COMPRESS_THRESHOLD`.
//! Role: Portable, closed value format stored in entry payloads.
//! Invariants: `decode(encode(v)) == v` for every value `encode` accepts.
//! Invariants: Unsupported values (NaN, excessive nesting) fail with `Serialization`.
//!
//! Payload layout: one flags byte (bit 0 = zlib-compressed) followed by the body.
//! The top-level type tag lives in the entry header, so the body of the root
//! value carries no tag; nested values are `tag || body`.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;
const FLAG_COMPRESSED: u8 = 0x01;
const MAX_DEPTH: usize = 64;
const MAX_DECOMPRESSED: u64 = 256 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Null = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    Text = 4,
    Bytes = 5,
    List = 6,
    Map = 7,
    Opaque = 8,
}

impl TypeTag {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => TypeTag::Null,
            1 => TypeTag::Bool,
            2 => TypeTag::Int,
            3 => TypeTag::Float,
            4 => TypeTag::Text,
            5 => TypeTag::Bytes,
            6 => TypeTag::List,
            7 => TypeTag::Map,
            8 => TypeTag::Opaque,
            other => {
                return Err(Error::new(ErrorKind::Serialization)
                    .with_message(format!("unknown type tag {other}")));
            }
        })
    }
}

/// A value stored in a pool.
///
/// `Opaque` carries bytes produced by some other runtime together with the
/// name of the type it came from; this crate never interprets them.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Opaque { type_name: String, data: Vec<u8> },
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Text(_) => TypeTag::Text,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::List(_) => TypeTag::List,
            Value::Map(_) => TypeTag::Map,
            Value::Opaque { .. } => TypeTag::Opaque,
        }
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Codec {
    /// Bodies longer than this are compressed when that makes them smaller.
    /// `None` disables compression.
    pub compress_threshold: Option<usize>,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            compress_threshold: Some(DEFAULT_COMPRESS_THRESHOLD),
        }
    }
}

impl Codec {
    pub fn uncompressed() -> Self {
        Self {
            compress_threshold: None,
        }
    }

    pub fn encode(&self, value: &Value) -> Result<(TypeTag, Vec<u8>), Error> {
        let mut body = Vec::new();
        write_body(&mut body, value, 0)?;

        if let Some(threshold) = self.compress_threshold {
            if body.len() > threshold {
                let compressed = compress(&body)?;
                if compressed.len() < body.len() {
                    let mut out = Vec::with_capacity(compressed.len() + 1);
                    out.push(FLAG_COMPRESSED);
                    out.extend_from_slice(&compressed);
                    return Ok((value.tag(), out));
                }
            }
        }

        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(0);
        out.extend_from_slice(&body);
        Ok((value.tag(), out))
    }

    pub fn decode(&self, tag: TypeTag, payload: &[u8]) -> Result<Value, Error> {
        let (&flags, body) = payload
            .split_first()
            .ok_or_else(|| malformed("empty payload"))?;
        if flags & !FLAG_COMPRESSED != 0 {
            return Err(malformed("unknown payload flags"));
        }
        let decompressed;
        let body = if flags & FLAG_COMPRESSED != 0 {
            decompressed = decompress(body)?;
            decompressed.as_slice()
        } else {
            body
        };
        let mut reader = Reader { buf: body, pos: 0 };
        let value = reader.read_body(tag, 0)?;
        if reader.pos != body.len() {
            return Err(malformed("trailing bytes after value"));
        }
        Ok(value)
    }
}

fn write_body(out: &mut Vec<u8>, value: &Value, depth: usize) -> Result<(), Error> {
    if depth > MAX_DEPTH {
        return Err(Error::new(ErrorKind::Serialization).with_message("value nested too deeply"));
    }
    match value {
        Value::Null => {}
        Value::Bool(flag) => out.push(u8::from(*flag)),
        Value::Int(number) => out.extend_from_slice(&number.to_le_bytes()),
        Value::Float(number) => {
            if number.is_nan() {
                return Err(Error::new(ErrorKind::Serialization)
                    .with_message("NaN cannot be stored"));
            }
            out.extend_from_slice(&number.to_bits().to_le_bytes());
        }
        Value::Text(text) => write_bytes(out, text.as_bytes())?,
        Value::Bytes(data) => write_bytes(out, data)?,
        Value::List(items) => {
            write_len(out, items.len())?;
            for item in items {
                out.push(item.tag() as u8);
                write_body(out, item, depth + 1)?;
            }
        }
        Value::Map(entries) => {
            write_len(out, entries.len())?;
            for (key, item) in entries {
                write_bytes(out, key.as_bytes())?;
                out.push(item.tag() as u8);
                write_body(out, item, depth + 1)?;
            }
        }
        Value::Opaque { type_name, data } => {
            write_bytes(out, type_name.as_bytes())?;
            write_bytes(out, data)?;
        }
    }
    Ok(())
}

fn write_len(out: &mut Vec<u8>, len: usize) -> Result<(), Error> {
    let len = u32::try_from(len).map_err(|_| {
        Error::new(ErrorKind::Serialization).with_message("collection exceeds u32 length")
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<(), Error> {
    write_len(out, data.len())?;
    out.extend_from_slice(data);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed("unexpected end of payload"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_len(&mut self) -> Result<usize, Error> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    fn read_u64(&mut self) -> Result<u64, Error> {
        let raw = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(raw);
        Ok(u64::from_le_bytes(out))
    }

    fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_len()?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|err| malformed("invalid utf-8").with_source(err))
    }

    fn read_blob(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    fn read_tagged(&mut self, depth: usize) -> Result<Value, Error> {
        let tag = TypeTag::from_u8(self.take(1)?[0])?;
        self.read_body(tag, depth)
    }

    fn read_body(&mut self, tag: TypeTag, depth: usize) -> Result<Value, Error> {
        if depth > MAX_DEPTH {
            return Err(malformed("value nested too deeply"));
        }
        Ok(match tag {
            TypeTag::Null => Value::Null,
            TypeTag::Bool => match self.take(1)?[0] {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(malformed("invalid boolean")),
            },
            TypeTag::Int => Value::Int(self.read_u64()? as i64),
            TypeTag::Float => {
                let number = f64::from_bits(self.read_u64()?);
                if number.is_nan() {
                    return Err(malformed("NaN in payload"));
                }
                Value::Float(number)
            }
            TypeTag::Text => Value::Text(self.read_string()?),
            TypeTag::Bytes => Value::Bytes(self.read_blob()?),
            TypeTag::List => {
                let count = self.read_len()?;
                // Every element takes at least one tag byte.
                if count > self.buf.len() - self.pos {
                    return Err(malformed("list count exceeds payload"));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_tagged(depth + 1)?);
                }
                Value::List(items)
            }
            TypeTag::Map => {
                let count = self.read_len()?;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let key = self.read_string()?;
                    let item = self.read_tagged(depth + 1)?;
                    if entries.insert(key, item).is_some() {
                        return Err(malformed("duplicate map key"));
                    }
                }
                Value::Map(entries)
            }
            TypeTag::Opaque => {
                let type_name = self.read_string()?;
                let data = self.read_blob()?;
                Value::Opaque { type_name, data }
            }
        })
    }
}

fn compress(body: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(1));
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .map_err(|err| {
            Error::new(ErrorKind::Serialization)
                .with_message("compression failed")
                .with_source(err)
        })
}

fn decompress(body: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    ZlibDecoder::new(body)
        .take(MAX_DECOMPRESSED)
        .read_to_end(&mut out)
        .map_err(|err| malformed("invalid compressed payload").with_source(err))?;
    Ok(out)
}

fn malformed(message: &str) -> Error {
    Error::new(ErrorKind::Serialization).with_message(message.to_string())
}
