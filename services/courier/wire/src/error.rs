//! Wire protocol error types.

use thiserror::Error;

/// Errors raised while decoding bytes received from the peer.
///
/// Every variant describes malformed or truncated input; decoding never
/// panics on untrusted data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before a complete structure could be read
    #[error("truncated input")]
    Truncated,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Invalid CBOR metadata
    #[error("cbor meta invalid")]
    Meta,

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown frame type
    #[error("unknown type {0}")]
    Type(u8),

    /// Unknown status code
    #[error("unknown code {0}")]
    Code(u8),

    /// Unknown value kind tag in a message body
    #[error("unknown value kind {0}")]
    Kind(u8),

    /// Nested messages deeper than the codec allows
    #[error("nesting depth exceeds {0}")]
    Depth(usize),

    /// Text field is not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),

    /// A field name appears twice in one message
    #[error("duplicate field {0:?}")]
    DuplicateField(String),

    /// A required metadata key is absent or has the wrong type
    #[error("missing field {0}")]
    MissingField(&'static str),

    /// Malformed frame structure
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
