//! Typed message model and its self-describing binary body encoding.
//!
//! ```text
//! message = u32 field_count, field*
//! field   = u16 name_len, name (utf-8), u8 kind, value
//! array   = u8 element_kind, u32 count, value*   (elements carry no tag)
//! ```
//!
//! Kinds: 1 string, 2 long, 3 double, 4 timestamp, 5 bytes, 6 message,
//! 7 array. Nesting through messages and message arrays is bounded by
//! [`MAX_DEPTH`].

use crate::codec::CodecError;
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved field holding the publish destination
pub const DESTINATION_FIELD: &str = "_dest";

/// Maximum nesting depth of messages within messages
pub const MAX_DEPTH: usize = 32;

const KIND_STRING: u8 = 1;
const KIND_LONG: u8 = 2;
const KIND_DOUBLE: u8 = 3;
const KIND_TIMESTAMP: u8 = 4;
const KIND_BYTES: u8 = 5;
const KIND_MESSAGE: u8 = 6;
const KIND_ARRAY: u8 = 7;

/// A typed field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// UTF-8 string
    String(String),
    /// 64-bit signed integer
    Long(i64),
    /// IEEE-754 double
    Double(f64),
    /// Point in time with nanosecond precision
    Timestamp(DateTime<Utc>),
    /// Opaque bytes
    Bytes(Bytes),
    /// Nested message
    Message(Message),
    /// Homogeneous array
    Array(Array),
}

/// Homogeneous array of one value kind
#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    /// Strings
    String(Vec<String>),
    /// Longs
    Long(Vec<i64>),
    /// Doubles
    Double(Vec<f64>),
    /// Timestamps
    Timestamp(Vec<DateTime<Utc>>),
    /// Byte strings
    Bytes(Vec<Bytes>),
    /// Nested messages
    Message(Vec<Message>),
}

impl Value {
    fn kind(&self) -> u8 {
        match self {
            Value::String(_) => KIND_STRING,
            Value::Long(_) => KIND_LONG,
            Value::Double(_) => KIND_DOUBLE,
            Value::Timestamp(_) => KIND_TIMESTAMP,
            Value::Bytes(_) => KIND_BYTES,
            Value::Message(_) => KIND_MESSAGE,
            Value::Array(_) => KIND_ARRAY,
        }
    }

    /// Borrow the string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the long value
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the double value
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the timestamp value
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the nested message
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Value::Message(m) => Some(m),
            _ => None,
        }
    }
}

impl Array {
    fn element_kind(&self) -> u8 {
        match self {
            Array::String(_) => KIND_STRING,
            Array::Long(_) => KIND_LONG,
            Array::Double(_) => KIND_DOUBLE,
            Array::Timestamp(_) => KIND_TIMESTAMP,
            Array::Bytes(_) => KIND_BYTES,
            Array::Message(_) => KIND_MESSAGE,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            Array::String(v) => v.len(),
            Array::Long(v) => v.len(),
            Array::Double(v) => v.len(),
            Array::Timestamp(v) => v.len(),
            Array::Bytes(v) => v.len(),
            Array::Message(v) => v.len(),
        }
    }

    /// Whether the array has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(v))
    }
}

impl From<Message> for Value {
    fn from(v: Message) -> Self {
        Value::Message(v)
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

/// A structured message: unique field names mapped to typed values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    fields: BTreeMap<String, Value>,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a field, returning the previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Set the destination field
    pub fn with_destination(self, destination: impl Into<String>) -> Self {
        self.with(DESTINATION_FIELD, destination.into())
    }

    /// Get a field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get a string field
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Get a long field
    pub fn get_long(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_long)
    }

    /// Remove a field
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Destination, if the message carries a string `_dest` field
    pub fn destination(&self) -> Option<&str> {
        self.get_str(DESTINATION_FIELD)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the message has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Encode the message body
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf, 0)?;
        Ok(buf.freeze())
    }

    /// Decode a message body; the whole input must be consumed
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut buf = body;
        let message = Self::decode_from(&mut buf, 0)?;
        if buf.has_remaining() {
            return Err(WireError::Malformed("trailing bytes after message"));
        }
        Ok(message)
    }

    fn encode_into(&self, buf: &mut BytesMut, depth: usize) -> Result<(), CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::Depth(MAX_DEPTH));
        }

        buf.put_u32(self.fields.len() as u32);
        for (name, value) in &self.fields {
            if name.is_empty() {
                return Err(CodecError::EmptyFieldName);
            }
            if name.len() > u16::MAX as usize {
                return Err(CodecError::FieldNameTooLong(name.len()));
            }
            buf.put_u16(name.len() as u16);
            buf.put_slice(name.as_bytes());
            buf.put_u8(value.kind());
            encode_value(value, buf, depth)?;
        }
        Ok(())
    }

    fn decode_from(buf: &mut &[u8], depth: usize) -> Result<Self, WireError> {
        if depth > MAX_DEPTH {
            return Err(WireError::Depth(MAX_DEPTH));
        }

        let count = take_u32(buf)? as usize;
        // every field needs at least a name length and a kind tag
        if count > buf.remaining() / 3 {
            return Err(WireError::Truncated);
        }

        let mut fields = BTreeMap::new();
        for _ in 0..count {
            let name_len = take_u16(buf)? as usize;
            if name_len == 0 {
                return Err(WireError::Malformed("empty field name"));
            }
            let name = take_string(buf, name_len, "field name")?;
            let kind = take_u8(buf)?;
            let value = decode_value(kind, buf, depth)?;
            if fields.contains_key(&name) {
                return Err(WireError::DuplicateField(name));
            }
            fields.insert(name, value);
        }

        Ok(Self { fields })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}:{}", name, value)?;
        }
        f.write_str("}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(v) => write!(f, "{:?}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Message(v) => write!(f, "{}", v),
            Value::Array(v) => write!(f, "[{} x kind {}]", v.len(), v.element_kind()),
        }
    }
}

fn encode_value(value: &Value, buf: &mut BytesMut, depth: usize) -> Result<(), CodecError> {
    match value {
        Value::String(v) => put_string(buf, v),
        Value::Long(v) => buf.put_i64(*v),
        Value::Double(v) => buf.put_u64(v.to_bits()),
        Value::Timestamp(v) => put_timestamp(buf, v),
        Value::Bytes(v) => {
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        Value::Message(v) => v.encode_into(buf, depth + 1)?,
        Value::Array(array) => {
            buf.put_u8(array.element_kind());
            buf.put_u32(array.len() as u32);
            match array {
                Array::String(items) => items.iter().for_each(|s| put_string(buf, s)),
                Array::Long(items) => items.iter().for_each(|v| buf.put_i64(*v)),
                Array::Double(items) => items.iter().for_each(|v| buf.put_u64(v.to_bits())),
                Array::Timestamp(items) => items.iter().for_each(|v| put_timestamp(buf, v)),
                Array::Bytes(items) => items.iter().for_each(|v| {
                    buf.put_u32(v.len() as u32);
                    buf.put_slice(v);
                }),
                Array::Message(items) => {
                    for item in items {
                        item.encode_into(buf, depth + 1)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn decode_value(kind: u8, buf: &mut &[u8], depth: usize) -> Result<Value, WireError> {
    Ok(match kind {
        KIND_STRING => Value::String(take_len_string(buf)?),
        KIND_LONG => Value::Long(take_i64(buf)?),
        KIND_DOUBLE => Value::Double(f64::from_bits(take_u64(buf)?)),
        KIND_TIMESTAMP => Value::Timestamp(take_timestamp(buf)?),
        KIND_BYTES => Value::Bytes(take_len_bytes(buf)?),
        KIND_MESSAGE => Value::Message(Message::decode_from(buf, depth + 1)?),
        KIND_ARRAY => Value::Array(decode_array(buf, depth)?),
        other => return Err(WireError::Kind(other)),
    })
}

fn decode_array(buf: &mut &[u8], depth: usize) -> Result<Array, WireError> {
    let element_kind = take_u8(buf)?;
    let count = take_u32(buf)? as usize;

    let min_element_size = match element_kind {
        KIND_STRING | KIND_BYTES | KIND_MESSAGE => 4,
        KIND_LONG | KIND_DOUBLE => 8,
        KIND_TIMESTAMP => 12,
        other => return Err(WireError::Kind(other)),
    };
    if count > buf.remaining() / min_element_size {
        return Err(WireError::Truncated);
    }

    Ok(match element_kind {
        KIND_STRING => Array::String(collect(count, || take_len_string(buf))?),
        KIND_LONG => Array::Long(collect(count, || take_i64(buf))?),
        KIND_DOUBLE => Array::Double(collect(count, || take_u64(buf).map(f64::from_bits))?),
        KIND_TIMESTAMP => Array::Timestamp(collect(count, || take_timestamp(buf))?),
        KIND_BYTES => Array::Bytes(collect(count, || take_len_bytes(buf))?),
        _ => Array::Message(collect(count, || Message::decode_from(buf, depth + 1))?),
    })
}

fn collect<T>(
    count: usize,
    mut next: impl FnMut() -> Result<T, WireError>,
) -> Result<Vec<T>, WireError> {
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(next()?);
    }
    Ok(items)
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_timestamp(buf: &mut BytesMut, value: &DateTime<Utc>) {
    buf.put_i64(value.timestamp());
    buf.put_u32(value.timestamp_subsec_nanos());
}

fn ensure(buf: &[u8], len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Truncated)
    } else {
        Ok(())
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn take_i64(buf: &mut &[u8]) -> Result<i64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

fn take_timestamp(buf: &mut &[u8]) -> Result<DateTime<Utc>, WireError> {
    let secs = take_i64(buf)?;
    let nanos = take_u32(buf)?;
    DateTime::from_timestamp(secs, nanos).ok_or(WireError::Malformed("timestamp out of range"))
}

fn take_string(buf: &mut &[u8], len: usize, what: &'static str) -> Result<String, WireError> {
    ensure(buf, len)?;
    let (head, tail) = buf.split_at(len);
    let s = std::str::from_utf8(head).map_err(|_| WireError::Utf8(what))?;
    *buf = tail;
    Ok(s.to_string())
}

fn take_len_string(buf: &mut &[u8]) -> Result<String, WireError> {
    let len = take_u32(buf)? as usize;
    take_string(buf, len, "string value")
}

fn take_len_bytes(buf: &mut &[u8]) -> Result<Bytes, WireError> {
    let len = take_u32(buf)? as usize;
    ensure(buf, len)?;
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(Bytes::copy_from_slice(head))
}
