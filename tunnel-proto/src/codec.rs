use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtoError;
use crate::message::HEADER_LEN;

/// Default fatal-protocol-error cutoff (spec §4.1: the framer itself does
/// not bound `L`; callers are expected to reject absurd lengths).
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Splits/assembles length-prefixed frames on the tunnel transport.
///
/// `decode` hands back the complete frame (length prefix included) as a
/// zero-copy `Bytes` view via `BytesMut::split_to`, so the framer never
/// reallocates the remaining buffered tail.
pub struct FrameCodec {
    max_frame_len: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec {
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl FrameCodec {
    pub fn new(max_frame_len: u32) -> Self {
        FrameCodec { max_frame_len }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtoError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let declared_len = (&src[0..4]).get_u32();
        if (declared_len as usize) < HEADER_LEN {
            return Err(ProtoError::FrameTooShort(declared_len));
        }
        if declared_len > self.max_frame_len {
            return Err(ProtoError::FrameTooLarge(declared_len, self.max_frame_len));
        }
        if src.len() < declared_len as usize {
            src.reserve(declared_len as usize - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(declared_len as usize).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtoError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::stream_id::StreamId;

    #[test]
    fn splits_on_arbitrary_chunk_boundaries() {
        let messages = vec![
            Message::DataOut {
                id: StreamId::new(1),
                data: Bytes::from_static(b"hello"),
            },
            Message::CloseLocal {
                id: StreamId::new(1),
            },
            Message::Connect {
                id: StreamId::new(2),
                host: Bytes::from_static(b"example.com"),
                port: 80,
            },
        ];
        let mut wire = BytesMut::new();
        for m in &messages {
            wire.extend_from_slice(&m.encode());
        }
        let wire = wire.freeze();

        // Feed the codec in ever-changing, arbitrarily small chunks.
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let chunk_sizes = [1usize, 2, 3, 7, 11, 50];
        let mut chunk_idx = 0;
        while offset < wire.len() {
            let size = chunk_sizes[chunk_idx % chunk_sizes.len()].min(wire.len() - offset);
            chunk_idx += 1;
            buf.extend_from_slice(&wire[offset..offset + size]);
            offset += size;
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push(Message::decode(frame).unwrap());
            }
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty(), "no residue should remain past the last frame");
        assert_eq!(decoded, messages);
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = FrameCodec::new(10);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&20u32.to_be_bytes());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge(20, 10)));
    }

    #[test]
    fn waits_for_more_bytes_when_incomplete() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 9, 5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0, 0, 0, 1]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 9);
    }
}
