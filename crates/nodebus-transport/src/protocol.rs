//! Frame definitions for the bus wire protocol.
//!
//! Every message on a connection is a fixed 8-byte header followed by the
//! payload:
//!
//! ```text
//! magic:u16 | tag:u16 | payload_length:u32 | payload
//! ```
//!
//! All header fields are big-endian. The tag selects between generic bus
//! traffic and the log-shipping stream, which share the same header shape.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Frame header size in bytes (magic:2 + tag:2 + payload_length:4).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Protocol magic number for frame validation ("NB").
pub const MAGIC: u16 = 0x4E42;

/// Largest payload a peer may announce. Large enough for multi-megabyte
/// attachments inlined into bus envelopes.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Type tag carried in the second header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameTag {
    /// Serialized bus envelope.
    Bus = 0x0001,
    /// UTF-8 log line shipped to a remote log endpoint.
    Log = 0x00F0,
}

impl FrameTag {
    /// Raw wire value of this tag.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for FrameTag {
    type Error = TransportError;

    fn try_from(raw: u16) -> Result<Self> {
        match raw {
            0x0001 => Ok(FrameTag::Bus),
            0x00F0 => Ok(FrameTag::Log),
            other => Err(TransportError::UnknownTag(other)),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number.
    pub magic: u16,
    /// Frame type tag.
    pub tag: FrameTag,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a header for a payload of the given length.
    pub fn new(tag: FrameTag, payload_length: u32) -> Self {
        Self {
            magic: MAGIC,
            tag,
            payload_length,
        }
    }

    /// Append the 8 header bytes to `buf`.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.magic);
        buf.put_u16(self.tag.as_u16());
        buf.put_u32(self.payload_length);
    }

    /// Decode and validate a header. `buf` must hold at least
    /// [`FRAME_HEADER_SIZE`] bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("header needs {} bytes, got {}", FRAME_HEADER_SIZE, buf.len()),
            });
        }
        let magic = buf.get_u16();
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let tag = FrameTag::try_from(buf.get_u16())?;
        let payload_length = buf.get_u32();
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            magic,
            tag,
            payload_length,
        })
    }
}

/// A single frame: header plus owned payload.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame around `payload`.
    ///
    /// Payloads above [`MAX_PAYLOAD_SIZE`] are rejected so a sender never
    /// produces a frame its peer will refuse.
    pub fn new(tag: FrameTag, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or(TransportError::PayloadTooLarge {
                size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max_size: MAX_PAYLOAD_SIZE,
            })?;
        Ok(Self {
            header: FrameHeader::new(tag, len),
            payload,
        })
    }

    /// Frame type tag.
    pub fn tag(&self) -> FrameTag {
        self.header.tag
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.header.encode_into(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one complete frame from `buf`. Trailing bytes are an error.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = FrameHeader::decode(buf)?;
        let body = &buf[FRAME_HEADER_SIZE..];
        if body.len() != header.payload_length as usize {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "header announces {} payload bytes, buffer holds {}",
                    header.payload_length,
                    body.len()
                ),
            });
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout_is_big_endian() {
        let frame = Frame::new(FrameTag::Bus, vec![0xAA; 3]).unwrap();
        let encoded = frame.encode();
        assert_eq!(&encoded[..8], &[0x4E, 0x42, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(&encoded[8..], &[0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::new(FrameTag::Log, Vec::new()).unwrap();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.tag(), FrameTag::Log);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_multi_megabyte_payload() {
        let payload: Vec<u8> = (0..5 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let frame = Frame::new(FrameTag::Bus, payload.clone()).unwrap();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.header.payload_length as usize, payload.len());
        assert_eq!(decoded.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut raw = Frame::new(FrameTag::Bus, b"x".to_vec()).unwrap().encode().to_vec();
        raw[0] = 0xFF;
        match Frame::decode(&raw) {
            Err(TransportError::InvalidMagic { expected, got }) => {
                assert_eq!(expected, MAGIC);
                assert_eq!(got, 0xFF42);
            }
            other => panic!("expected InvalidMagic, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut raw = Frame::new(FrameTag::Bus, Vec::new()).unwrap().encode().to_vec();
        raw[3] = 0x07;
        assert!(matches!(Frame::decode(&raw), Err(TransportError::UnknownTag(0x0007))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut raw = Vec::new();
        FrameHeader {
            magic: MAGIC,
            tag: FrameTag::Bus,
            payload_length: MAX_PAYLOAD_SIZE + 1,
        }
        .encode_into(&mut raw);
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let raw = Frame::new(FrameTag::Bus, b"hello".to_vec()).unwrap().encode();
        assert!(matches!(
            Frame::decode(&raw[..raw.len() - 1]),
            Err(TransportError::InvalidFrame { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_frame_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..4096), log in any::<bool>()) {
            let tag = if log { FrameTag::Log } else { FrameTag::Bus };
            let frame = Frame::new(tag, payload.clone()).unwrap();
            let decoded = Frame::decode(&frame.encode()).unwrap();
            prop_assert_eq!(decoded.tag(), tag);
            prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        }
    }
}
