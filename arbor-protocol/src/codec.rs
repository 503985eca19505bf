//! Length-prefixed frame codec.
//!
//! Header layout, little endian: `length: u32 | message_type: u16 |
//! request_id: u32`. The length covers the header itself. Frames split
//! across reads are reassembled by the underlying buffer; a declared length
//! below the header size or above [`MAX_FRAME_LEN`] is a protocol violation
//! that terminates the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ProtocolError;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 10;

/// Hard upper bound on a single frame, header included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// One raw frame: the header fields plus an opaque payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub message_type: u16,
    pub request_id: u32,
    pub payload: Bytes,
}

/// Tokio codec turning a byte stream into [`Frame`]s and back.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let declared = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let total = declared as usize;
        if total < HEADER_LEN || total > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameLength(declared));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(total);
        frame.advance(4);
        let message_type = frame.get_u16_le();
        let request_id = frame.get_u32_le();
        Ok(Some(Frame {
            message_type,
            request_id,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let total = HEADER_LEN + frame.payload.len();
        if total > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameLength(total as u32));
        }
        dst.reserve(total);
        dst.put_u32_le(total as u32);
        dst.put_u16_le(frame.message_type);
        dst.put_u32_le(frame.request_id);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Frame {
        Frame {
            message_type: 11,
            request_id: 77,
            payload: payload.to_vec().into(),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame(b"{\"a\":1}"), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame(b"{\"a\":1}"));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec.encode(frame(b"{\"a\":1}"), &mut full).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[6..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame(b"{\"a\":1}")));
    }

    #[test]
    fn two_frames_in_one_read_both_decode() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame(b"{}"), &mut buf).unwrap();
        codec.encode(frame(b"{\"b\":2}"), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame(b"{}")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame(b"{\"b\":2}")));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn undersized_length_is_fatal() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le(4);
        buf.put_u16_le(1);
        buf.put_u32_le(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameLength(4))
        ));
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME_LEN + 1) as u32);
        buf.put_u16_le(1);
        buf.put_u32_le(0);
        assert!(codec.decode(&mut buf).is_err());
    }
}
