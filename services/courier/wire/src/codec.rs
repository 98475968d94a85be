//! CBOR metadata helpers and encoding errors.
//!
//! Control fields of every frame (credentials, matcher, identity, ack
//! tokens, reasons) live in a CBOR map next to the fixed header. This module
//! builds that map and reads typed values back out of it.

use crate::frame::RawFrame;
use crate::header::FrameHeader;
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

/// Parsed metadata map
pub type Meta = BTreeMap<String, ciborium::Value>;

/// CBOR metadata builder helper
#[derive(Debug, Clone, Default)]
pub struct MetaBuilder {
    map: Meta,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Insert a string value when present
    pub fn insert_opt_str(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.insert_str(key, value),
            None => self,
        }
    }

    /// Insert a u32 value
    pub fn insert_u32(mut self, key: &str, value: u32) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Insert a u64 value
    pub fn insert_u64(mut self, key: &str, value: u64) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Insert a u64 value when present
    pub fn insert_opt_u64(self, key: &str, value: Option<u64>) -> Self {
        match value {
            Some(value) => self.insert_u64(key, value),
            None => self,
        }
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, CodecError> {
        if self.map.is_empty() {
            return Ok(Bytes::new());
        }

        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| CodecError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

/// Frame builder combining header, metadata and body
#[derive(Debug)]
pub struct FrameBuilder {
    header: FrameHeader,
    meta: MetaBuilder,
    body: Bytes,
}

impl FrameBuilder {
    /// Create a new frame builder
    pub fn new(header: FrameHeader) -> Self {
        Self {
            header,
            meta: MetaBuilder::new(),
            body: Bytes::new(),
        }
    }

    /// Replace the metadata
    pub fn meta(mut self, meta: MetaBuilder) -> Self {
        self.meta = meta;
        self
    }

    /// Set body
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Build and encode the frame
    pub fn build(self, max_frame: usize) -> Result<Bytes, CodecError> {
        let meta_raw = self.meta.build()?;
        RawFrame::new(self.header, meta_raw, self.body)
            .encode(max_frame)
            .map_err(CodecError::Wire)
    }
}

/// Errors raised while encoding outbound frames
#[derive(Error, Debug)]
pub enum CodecError {
    /// Wire protocol error (frame too large)
    #[error("wire error: {0}")]
    Wire(#[from] crate::WireError),
    /// Metadata encoding error
    #[error("metadata encoding failed")]
    MetaEncode,
    /// Published message lacks a string destination field
    #[error("message has no string destination field")]
    MissingDestination,
    /// Field name is empty
    #[error("field name is empty")]
    EmptyFieldName,
    /// Field name does not fit the length prefix
    #[error("field name too long: {0} bytes")]
    FieldNameTooLong(usize),
    /// Nested messages deeper than the codec allows
    #[error("nesting depth exceeds {0}")]
    Depth(usize),
}

/// Parse CBOR metadata into a map; empty input yields an empty map
pub fn parse_meta(meta_raw: &[u8]) -> Result<Meta, crate::WireError> {
    if meta_raw.is_empty() {
        return Ok(Meta::new());
    }

    let value: ciborium::Value =
        ciborium::from_reader(meta_raw).map_err(|_| crate::WireError::Meta)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(crate::WireError::Meta)
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &Meta, key: &str) -> Option<String> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Text(s) = v {
            Some(s.clone())
        } else {
            None
        }
    })
}

/// Get u32 value from metadata
pub fn get_meta_u32(meta: &Meta, key: &str) -> Option<u32> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Integer(i) = v {
            (*i).try_into().ok()
        } else {
            None
        }
    })
}

/// Get u64 value from metadata
pub fn get_meta_u64(meta: &Meta, key: &str) -> Option<u64> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Integer(i) = v {
            (*i).try_into().ok()
        } else {
            None
        }
    })
}

/// Get a required string value, failing with [`crate::WireError::MissingField`]
pub fn require_meta_str(meta: &Meta, key: &'static str) -> Result<String, crate::WireError> {
    get_meta_str(meta, key).ok_or(crate::WireError::MissingField(key))
}

/// Get a required u64 value, failing with [`crate::WireError::MissingField`]
pub fn require_meta_u64(meta: &Meta, key: &'static str) -> Result<u64, crate::WireError> {
    get_meta_u64(meta, key).ok_or(crate::WireError::MissingField(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
    use crate::header::FrameType;
    use bytes::BytesMut;

    #[test]
    fn test_meta_builder() {
        let meta = MetaBuilder::new()
            .insert_str("matcher", "{}")
            .insert_u32("version", 1)
            .insert_u64("token", u64::MAX)
            .insert_opt_str("durable", None)
            .build()
            .unwrap();

        let parsed = parse_meta(&meta).unwrap();
        assert_eq!(get_meta_str(&parsed, "matcher"), Some("{}".to_string()));
        assert_eq!(get_meta_u32(&parsed, "version"), Some(1));
        assert_eq!(get_meta_u64(&parsed, "token"), Some(u64::MAX));
        assert_eq!(get_meta_u32(&parsed, "token"), None);
        assert!(!parsed.contains_key("durable"));
        assert_eq!(
            require_meta_str(&parsed, "identity"),
            Err(crate::WireError::MissingField("identity"))
        );
    }

    #[test]
    fn test_empty_meta_round_trips() {
        let meta = MetaBuilder::new().build().unwrap();
        assert!(meta.is_empty());
        assert!(parse_meta(&meta).unwrap().is_empty());
    }

    #[test]
    fn test_non_map_meta_is_rejected() {
        let mut buf = Vec::new();
        ciborium::into_writer(&ciborium::Value::Integer(3.into()), &mut buf).unwrap();
        assert_eq!(parse_meta(&buf), Err(crate::WireError::Meta));
        assert_eq!(parse_meta(&[0xff, 0x00]), Err(crate::WireError::Meta));
    }

    #[test]
    fn test_frame_builder() {
        let frame_bytes = FrameBuilder::new(FrameHeader::new(FrameType::Publish, 42))
            .meta(MetaBuilder::new().insert_str("identity", "sub-1"))
            .body(Bytes::from_static(b"hello world"))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();

        let mut buf = BytesMut::from(&frame_bytes[..]);
        let frame = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.req_id, 42);
        assert_eq!(&frame.body[..], b"hello world");
    }
}
