//! Fixed frame header for the wire protocol.
//!
//! Every frame starts with a 16-byte header carrying the frame type, flags,
//! a status code and the request id used to correlate acknowledgments.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// Client login request
    Login = 0x01,
    /// Server reply to a successful login
    LoginResponse = 0x02,
    /// Heartbeat in either direction
    Heartbeat = 0x03,
    /// Publish a message
    Publish = 0x10,
    /// Publish accepted
    PublishAck = 0x11,
    /// Publish rejected
    PublishError = 0x12,
    /// Create a subscription
    Subscribe = 0x20,
    /// Subscription accepted
    SubscribeAck = 0x21,
    /// Subscription rejected
    SubscribeError = 0x22,
    /// Remove a subscription
    Unsubscribe = 0x23,
    /// Subscription removed
    UnsubscribeAck = 0x24,
    /// Message delivered to a subscription
    Deliver = 0x30,
    /// Acknowledge a delivered message
    Acknowledge = 0x31,
    /// Graceful session termination
    Disconnect = 0x40,
    /// Generic error not tied to a request
    Error = 0x41,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, crate::WireError> {
        match value {
            0x01 => Ok(FrameType::Login),
            0x02 => Ok(FrameType::LoginResponse),
            0x03 => Ok(FrameType::Heartbeat),
            0x10 => Ok(FrameType::Publish),
            0x11 => Ok(FrameType::PublishAck),
            0x12 => Ok(FrameType::PublishError),
            0x20 => Ok(FrameType::Subscribe),
            0x21 => Ok(FrameType::SubscribeAck),
            0x22 => Ok(FrameType::SubscribeError),
            0x23 => Ok(FrameType::Unsubscribe),
            0x24 => Ok(FrameType::UnsubscribeAck),
            0x30 => Ok(FrameType::Deliver),
            0x31 => Ok(FrameType::Acknowledge),
            0x40 => Ok(FrameType::Disconnect),
            0x41 => Ok(FrameType::Error),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// Heartbeat is an echo of a peer heartbeat
        const REPLY = 1 << 0;
        /// Acknowledge every delivery up to and including the token
        const CUMULATIVE = 1 << 1;
        /// Delivery was sent before on an earlier session
        const REDELIVERED = 1 << 2;
    }
}

/// Status codes carried by error, rejection and disconnect frames
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// Request failed on the server
    Failed = 1,
    /// Caller lacks permission for the request
    Disallowed = 2,
    /// Request was malformed or referenced invalid state
    Invalid = 3,
    /// Credentials rejected
    NotAuthorized = 4,
    /// Referenced object does not exist
    NotFound = 5,
    /// Server is restarting; reconnect later
    Restart = 6,
}

impl TryFrom<u8> for StatusCode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Failed),
            2 => Ok(StatusCode::Disallowed),
            3 => Ok(StatusCode::Invalid),
            4 => Ok(StatusCode::NotAuthorized),
            5 => Ok(StatusCode::NotFound),
            6 => Ok(StatusCode::Restart),
            _ => Err(crate::WireError::Code(value)),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Ok => "ok",
            StatusCode::Failed => "failed",
            StatusCode::Disallowed => "disallowed",
            StatusCode::Invalid => "invalid",
            StatusCode::NotAuthorized => "not authorized",
            StatusCode::NotFound => "not found",
            StatusCode::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// Frame header (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Protocol version (must be 1)
    pub ver: u8,
    /// Frame type
    pub typ: FrameType,
    /// Frame flags
    pub flags: Flags,
    /// Status code for error and rejection frames
    pub code: StatusCode,
    /// Request id for correlated frames, or heartbeat token (0 if none)
    pub req_id: u64,
}

impl FrameHeader {
    /// Create a header for the given frame type and request id
    pub fn new(typ: FrameType, req_id: u64) -> Self {
        Self {
            ver: WIRE_VERSION,
            typ,
            flags: Flags::empty(),
            code: StatusCode::Ok,
            req_id,
        }
    }

    /// Set the flags
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the status code
    pub fn with_code(mut self, code: StatusCode) -> Self {
        self.code = code;
        self
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ver);
        buf.put_u8(self.typ as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u8(self.code as u8);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u64(self.req_id);
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(crate::WireError::Truncated);
        }

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(crate::WireError::Version(ver));
        }

        let typ = FrameType::try_from(buf.get_u8())?;
        let flags = Flags::from_bits(buf.get_u16()).ok_or(crate::WireError::Reserved)?;
        let code = StatusCode::try_from(buf.get_u8())?;
        let reserved0 = buf.get_u8();
        let reserved1 = buf.get_u16();

        if reserved0 != 0 || reserved1 != 0 {
            return Err(crate::WireError::Reserved);
        }

        let req_id = buf.get_u64();

        Ok(Self {
            ver,
            typ,
            flags,
            code,
            req_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x01).unwrap(), FrameType::Login);
        assert_eq!(FrameType::try_from(0x30).unwrap(), FrameType::Deliver);
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_flags() {
        let flags = Flags::REPLY | Flags::CUMULATIVE;
        assert!(flags.contains(Flags::REPLY));
        assert!(flags.contains(Flags::CUMULATIVE));
        assert!(!flags.contains(Flags::REDELIVERED));
    }

    #[test]
    fn test_header_encode_decode() {
        let header = FrameHeader::new(FrameType::PublishError, 42)
            .with_flags(Flags::REDELIVERED)
            .with_code(StatusCode::Disallowed);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = FrameHeader::decode(&mut bytes).unwrap();

        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_rejects_bad_input() {
        let mut short = Bytes::from_static(&[1, 0x01, 0, 0]);
        assert_eq!(FrameHeader::decode(&mut short), Err(crate::WireError::Truncated));

        let mut buf = BytesMut::new();
        FrameHeader::new(FrameType::Login, 0).encode(&mut buf);
        let mut raw = buf.to_vec();
        raw[0] = 2;
        assert_eq!(
            FrameHeader::decode(&mut Bytes::from(raw.clone())),
            Err(crate::WireError::Version(2))
        );

        raw[0] = WIRE_VERSION;
        raw[5] = 1;
        assert_eq!(
            FrameHeader::decode(&mut Bytes::from(raw)),
            Err(crate::WireError::Reserved)
        );
    }
}
