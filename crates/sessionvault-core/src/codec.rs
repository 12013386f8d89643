//! Binary payload codec for session state.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! "SVSS" version:u8
//! creation:i64 last_accessed:i64 this_accessed:i64   (epoch millis)
//! max_inactive:i32 is_new:u8 is_valid:u8
//! id:str principal:(u8 flag, str?)
//! attr_count:u32 { key:str tag:u8 value }*
//! 0xFE
//! ```
//!
//! Strings and binaries are `u32` length-prefixed.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};

use crate::{
    error::CodecError,
    session::{AttributeValue, MAX_NESTING_DEPTH, Session},
    traits::SessionFactory,
};

const MAGIC: &[u8; 4] = b"SVSS";
const VERSION: u8 = 1;
const TRAILER: u8 = 0xFE;

const TAG_STRING: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_BOOL: u8 = 0x04;
const TAG_DOCUMENT: u8 = 0x05;
const TAG_BINARY: u8 = 0x06;

/// Serialize the session's resumable state into an opaque payload.
///
/// # Errors
/// Returns [`CodecError::UnsupportedAttributeType`] if a string, binary or
/// document is too large to be length-prefixed, or documents are nested
/// deeper than [`MAX_NESTING_DEPTH`].
pub fn serialize(session: &Session) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);

    buf.put_i64(session.creation_time.timestamp_millis());
    buf.put_i64(session.last_accessed_time.timestamp_millis());
    buf.put_i64(session.this_accessed_time.timestamp_millis());
    buf.put_i32(session.max_inactive_interval);
    buf.put_u8(u8::from(session.is_new));
    buf.put_u8(u8::from(session.is_valid));
    put_str(&mut buf, &session.id)?;
    match &session.principal {
        Some(principal) => {
            buf.put_u8(1);
            put_str(&mut buf, principal)?;
        }
        None => buf.put_u8(0),
    }

    // Sorted so identical sessions always produce identical payloads.
    let mut keys: Vec<&String> = session.attributes.keys().collect();
    keys.sort();
    put_len(&mut buf, keys.len())?;
    for key in keys {
        put_str(&mut buf, key)?;
        put_value(&mut buf, &session.attributes[key], 0)?;
    }

    buf.put_u8(TRAILER);
    Ok(buf.to_vec())
}

/// Rebuild a session from a payload written by [`serialize`].
///
/// The blank session comes from `factory`; it is only handed back once the
/// whole payload has been decoded.
///
/// # Errors
/// Returns [`CodecError::CorruptPayload`] if the stream does not have the
/// expected structure, or [`CodecError::UnknownAttributeType`] if an attribute
/// carries a type tag this build does not know.
pub fn deserialize(bytes: &[u8], factory: &dyn SessionFactory) -> Result<Session, CodecError> {
    let mut reader = Reader { buf: bytes };

    if reader.take(MAGIC.len(), "magic")? != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = reader.u8("version")?;
    if version != VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }

    let mut session = factory.create_empty_session();
    session.creation_time = reader.timestamp("creation time")?;
    session.last_accessed_time = reader.timestamp("last accessed time")?;
    session.this_accessed_time = reader.timestamp("this accessed time")?;
    session.max_inactive_interval = reader.i32("max inactive interval")?;
    session.is_new = reader.flag("is_new")?;
    session.is_valid = reader.flag("is_valid")?;
    session.id = reader.string("id")?;
    session.principal = if reader.flag("principal marker")? {
        Some(reader.string("principal")?)
    } else {
        None
    };

    let count = reader.len("attribute count")?;
    session.attributes.clear();
    for _ in 0..count {
        let key = reader.string("attribute key")?;
        let value = reader.value(0)?;
        session.attributes.insert(key, value);
    }

    if reader.u8("trailer")? != TRAILER {
        return Err(corrupt("bad trailer"));
    }
    if reader.buf.has_remaining() {
        return Err(corrupt(format!(
            "{} trailing bytes",
            reader.buf.remaining()
        )));
    }

    Ok(session)
}

fn corrupt(reason: impl Into<String>) -> CodecError {
    CodecError::CorruptPayload(reason.into())
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), CodecError> {
    let len = u32::try_from(len)
        .map_err(|_| CodecError::UnsupportedAttributeType(format!("length {len} too large")))?;
    buf.put_u32(len);
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    put_len(buf, s.len())?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &AttributeValue, depth: usize) -> Result<(), CodecError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(CodecError::UnsupportedAttributeType(format!(
            "document nested deeper than {MAX_NESTING_DEPTH} levels"
        )));
    }
    match value {
        AttributeValue::String(s) => {
            buf.put_u8(TAG_STRING);
            put_str(buf, s)?;
        }
        AttributeValue::Int(i) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*i);
        }
        AttributeValue::Float(f) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64(*f);
        }
        AttributeValue::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*b));
        }
        AttributeValue::Document(map) => {
            buf.put_u8(TAG_DOCUMENT);
            put_len(buf, map.len())?;
            for (key, nested) in map {
                put_str(buf, key)?;
                put_value(buf, nested, depth + 1)?;
            }
        }
        AttributeValue::Binary(bytes) => {
            buf.put_u8(TAG_BINARY);
            put_len(buf, bytes.len())?;
            buf.put_slice(bytes);
        }
    }
    Ok(())
}

/// Bounds-checked cursor over a payload.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize, what: &str) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(corrupt(format!("truncated at {what}")));
        }
        Ok(())
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], CodecError> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &str) -> Result<u8, CodecError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn i32(&mut self, what: &str) -> Result<i32, CodecError> {
        self.need(4, what)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self, what: &str) -> Result<i64, CodecError> {
        self.need(8, what)?;
        Ok(self.buf.get_i64())
    }

    fn flag(&mut self, what: &str) -> Result<bool, CodecError> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(corrupt(format!("bad {what} marker {other:#04x}"))),
        }
    }

    fn len(&mut self, what: &str) -> Result<usize, CodecError> {
        self.need(4, what)?;
        let len = self.buf.get_u32() as usize;
        // Every element needs at least one byte, so a larger count is a lie.
        if len > self.buf.remaining() {
            return Err(corrupt(format!("{what} {len} exceeds payload")));
        }
        Ok(len)
    }

    fn string(&mut self, what: &str) -> Result<String, CodecError> {
        let len = self.len(what)?;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| corrupt(format!("{what} is not UTF-8")))
    }

    fn timestamp(&mut self, what: &str) -> Result<DateTime<Utc>, CodecError> {
        let millis = self.i64(what)?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| corrupt(format!("{what} {millis} out of range")))
    }

    fn value(&mut self, depth: usize) -> Result<AttributeValue, CodecError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(corrupt("attribute nesting too deep"));
        }
        let tag = self.u8("attribute tag")?;
        match tag {
            TAG_STRING => self.string("string attribute").map(AttributeValue::String),
            TAG_INT => self.i64("int attribute").map(AttributeValue::Int),
            TAG_FLOAT => {
                self.need(8, "float attribute")?;
                Ok(AttributeValue::Float(self.buf.get_f64()))
            }
            TAG_BOOL => self.flag("bool attribute").map(AttributeValue::Bool),
            TAG_DOCUMENT => {
                let count = self.len("document size")?;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = self.string("document key")?;
                    let nested = self.value(depth + 1)?;
                    map.insert(key, nested);
                }
                Ok(AttributeValue::Document(map))
            }
            TAG_BINARY => {
                let len = self.len("binary attribute")?;
                let bytes = self.take(len, "binary attribute")?;
                Ok(AttributeValue::Binary(bytes.to_vec()))
            }
            unknown => Err(CodecError::UnknownAttributeType(unknown)),
        }
    }
}
