//! Wire protocol framing, message encoding and typed frames for courier.
//!
//! This crate provides the codec used between a courier client and the
//! messaging server: a length-prefixed frame with a fixed header, CBOR
//! control metadata, and a self-describing binary encoding for structured
//! messages.
//!
//! ## Features
//!
//! - **Fixed Header**: 16-byte header with type, flags, status code and request id
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **CBOR Metadata**: Extensible control fields using CBOR maps
//! - **Typed Messages**: Strings, longs, doubles, timestamps, bytes, nested
//!   messages and homogeneous arrays, round-tripped exactly
//! - **Defensive Decoding**: Every length is checked before use; malformed
//!   input yields [`WireError`], never a panic
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | Frame Header (16B)   | type, flags, code, req_id  |
//! +----------------------+----------------------------+
//! | u32 meta_len         | CBOR map length            |
//! +----------------------+----------------------------+
//! | meta_bytes           | control fields (CBOR)      |
//! +----------------------+----------------------------+
//! | body                 | encoded message (0..N)     |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;
pub mod protocol;

// Re-export main types
pub use codec::{
    get_meta_str, get_meta_u32, get_meta_u64, parse_meta, CodecError, FrameBuilder, Meta,
    MetaBuilder,
};
pub use error::WireError;
pub use frame::{
    FrameDecoder, RawFrame, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE, MAX_META_SIZE,
};
pub use header::{Flags, FrameHeader, FrameType, StatusCode, FRAME_HEADER_SIZE, WIRE_VERSION};
pub use message::{Array, Message, Value, DESTINATION_FIELD, MAX_DEPTH};
pub use protocol::{
    decode_frame, AckMode, Deliver, DurableType, Frame, Login, LoginResponse, Subscribe,
    PROTOCOL_VERSION,
};
