//! Length-prefixed framing for the wire protocol.
//!
//! A raw frame is the header, a CBOR metadata section and an opaque body.
//! [`FrameDecoder`] splits a byte stream into raw frames without interpreting
//! metadata or body; [`crate::protocol::Frame`] gives them meaning.

use crate::header::{FrameHeader, FRAME_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size (16 MiB default, 64 MiB hard limit)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Hard maximum frame size limit (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum metadata size (64 KiB)
pub const MAX_META_SIZE: usize = 64 * 1024;

/// Undecoded wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Frame header
    pub header: FrameHeader,
    /// Metadata as raw CBOR bytes
    pub meta_raw: Bytes,
    /// Encoded message body (may be empty)
    pub body: Bytes,
}

impl RawFrame {
    /// Create a new raw frame
    pub fn new(header: FrameHeader, meta_raw: Bytes, body: Bytes) -> Self {
        Self {
            header,
            meta_raw,
            body,
        }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        4 + FRAME_HEADER_SIZE + 4 + self.meta_raw.len() + self.body.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        let total_size = self.encoded_size();
        if total_size > max_frame_size.min(HARD_MAX_FRAME_SIZE) {
            return Err(crate::WireError::Size(total_size));
        }
        if self.meta_raw.len() > MAX_META_SIZE {
            return Err(crate::WireError::Size(self.meta_raw.len()));
        }

        let mut buf = BytesMut::with_capacity(total_size);

        // Frame length (everything after this u32)
        buf.put_u32((total_size - 4) as u32);
        self.header.encode(&mut buf);
        buf.put_u32(self.meta_raw.len() as u32);
        buf.put_slice(&self.meta_raw);
        buf.put_slice(&self.body);

        Ok(buf.freeze())
    }

    /// Parse exactly one frame from its encoded bytes.
    ///
    /// Fails with [`crate::WireError::Truncated`] if the input is short and
    /// [`crate::WireError::Malformed`] if bytes trail the frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::WireError> {
        let mut buf = BytesMut::from(bytes);
        let frame = FrameDecoder::new()
            .decode(&mut buf)?
            .ok_or(crate::WireError::Truncated)?;
        if !buf.is_empty() {
            return Err(crate::WireError::Malformed("trailing bytes after frame"));
        }
        Ok(frame)
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom frame size limit (capped at the hard limit)
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `buf` only when a full frame is available.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawFrame>, crate::WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len > self.max_frame_size {
            return Err(crate::WireError::Size(frame_len));
        }
        if frame_len < FRAME_HEADER_SIZE + 4 {
            return Err(crate::WireError::Malformed("frame shorter than header"));
        }

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();
        let header = FrameHeader::decode(&mut frame_buf)?;

        let meta_len = frame_buf.get_u32() as usize;
        if meta_len > MAX_META_SIZE || frame_buf.len() < meta_len {
            return Err(crate::WireError::Meta);
        }

        let meta_raw = frame_buf.split_to(meta_len);

        Ok(Some(RawFrame {
            header,
            meta_raw,
            body: frame_buf,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FrameType;

    fn sample() -> RawFrame {
        RawFrame::new(
            FrameHeader::new(FrameType::Publish, 7),
            Bytes::from_static(&[0xa0]),
            Bytes::from_static(b"body"),
        )
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let encoded = sample().encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), encoded.len() - 1);

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, sample());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_handles_back_to_back_frames() {
        let encoded = sample().encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded);
        buf.extend_from_slice(&encoded);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_size_limits() {
        let frame = sample();
        assert!(matches!(
            frame.encode(8),
            Err(crate::WireError::Size(_))
        ));

        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        let mut decoder = FrameDecoder::with_max_frame_size(512);
        assert_eq!(decoder.decode(&mut buf), Err(crate::WireError::Size(1024)));
    }

    #[test]
    fn test_meta_length_overrun_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_HEADER_SIZE + 4) as u32);
        FrameHeader::new(FrameType::Heartbeat, 0).encode(&mut buf);
        buf.put_u32(99);

        assert_eq!(
            FrameDecoder::new().decode(&mut buf),
            Err(crate::WireError::Meta)
        );
    }

    #[test]
    fn test_from_bytes_rejects_trailing_data() {
        let mut encoded = sample().encode(DEFAULT_MAX_FRAME_SIZE).unwrap().to_vec();
        assert_eq!(RawFrame::from_bytes(&encoded).unwrap(), sample());

        encoded.push(0);
        assert!(matches!(
            RawFrame::from_bytes(&encoded),
            Err(crate::WireError::Malformed(_))
        ));
    }
}
