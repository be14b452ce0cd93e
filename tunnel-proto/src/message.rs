use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtoError;
use crate::stream_id::StreamId;

/// Length field + type tag are always present; every frame is at least this
/// big even with an empty payload (spec §3: `len(M) >= 5`).
pub const HEADER_LEN: usize = 5;

const TYPE_CONNECT: u8 = 1;
const TYPE_CONNECT_REPLY: u8 = 2;
const TYPE_DATA_OUT: u8 = 3;
const TYPE_DATA_IN: u8 = 4;
const TYPE_CLOSE_LOCAL: u8 = 5;
const TYPE_CLOSE_REMOTE: u8 = 6;

/// One multiplexed tunnel message, matching spec §4.2 bit-exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// L -> R: open a stream to `host:port`.
    Connect {
        id: StreamId,
        host: Bytes,
        port: u16,
    },
    /// R -> L: nonzero `code` means the connect attempt failed.
    ConnectReply { id: StreamId, code: u8 },
    /// L -> R: bytes from the SOCKS client headed to the target.
    DataOut { id: StreamId, data: Bytes },
    /// R -> L: bytes from the target headed to the SOCKS client.
    DataIn { id: StreamId, data: Bytes },
    /// L -> R: the local SOCKS client closed; tear down the target side.
    CloseLocal { id: StreamId },
    /// R -> L: the target side closed or errored; tear down the client side.
    CloseRemote { id: StreamId },
}

impl Message {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Message::Connect { id, .. }
            | Message::ConnectReply { id, .. }
            | Message::DataOut { id, .. }
            | Message::DataIn { id, .. }
            | Message::CloseLocal { id }
            | Message::CloseRemote { id } => *id,
        }
    }

    /// Serialize the full frame: `LEN | TYPE | payload`, `LEN` counting
    /// itself.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        // Reserve the length prefix; it's patched in once the body is known.
        buf.put_u32(0);
        match self {
            Message::Connect { id, host, port } => {
                buf.put_u8(TYPE_CONNECT);
                buf.put_u32(id.get());
                buf.put_slice(host);
                buf.put_u16(*port);
            }
            Message::ConnectReply { id, code } => {
                buf.put_u8(TYPE_CONNECT_REPLY);
                buf.put_u32(id.get());
                buf.put_u8(*code);
            }
            Message::DataOut { id, data } => {
                buf.put_u8(TYPE_DATA_OUT);
                buf.put_u32(id.get());
                buf.put_slice(data);
            }
            Message::DataIn { id, data } => {
                buf.put_u8(TYPE_DATA_IN);
                buf.put_u32(id.get());
                buf.put_slice(data);
            }
            Message::CloseLocal { id } => {
                buf.put_u8(TYPE_CLOSE_LOCAL);
                buf.put_u32(id.get());
            }
            Message::CloseRemote { id } => {
                buf.put_u8(TYPE_CLOSE_REMOTE);
                buf.put_u32(id.get());
            }
        }
        let total_len = buf.len() as u32;
        buf[0..4].copy_from_slice(&total_len.to_be_bytes());
        buf
    }

    /// Decode a complete frame (including the 4-byte length prefix) into a
    /// `Message`. `frame` must be exactly `len(M)` bytes, as handed off by
    /// the framer.
    pub fn decode(mut frame: Bytes) -> Result<Message, ProtoError> {
        if frame.len() < HEADER_LEN {
            return Err(ProtoError::FrameTooShort(frame.len() as u32));
        }
        let declared_len = (&frame[0..4]).get_u32();
        if declared_len as usize != frame.len() {
            return Err(ProtoError::Malformed {
                kind: "frame",
                reason: "declared length does not match received length",
            });
        }
        frame.advance(4);
        let ty = frame.get_u8();
        match ty {
            TYPE_CONNECT => decode_connect(frame),
            TYPE_CONNECT_REPLY => decode_connect_reply(frame),
            TYPE_DATA_OUT => {
                let (id, data) = decode_data(frame, "data_out")?;
                Ok(Message::DataOut { id, data })
            }
            TYPE_DATA_IN => {
                let (id, data) = decode_data(frame, "data_in")?;
                Ok(Message::DataIn { id, data })
            }
            TYPE_CLOSE_LOCAL => decode_close(frame).map(|id| Message::CloseLocal { id }),
            TYPE_CLOSE_REMOTE => decode_close(frame).map(|id| Message::CloseRemote { id }),
            other => Err(ProtoError::UnknownType(other)),
        }
    }
}

fn decode_connect(mut body: Bytes) -> Result<Message, ProtoError> {
    if body.len() < 4 + 2 {
        return Err(ProtoError::Malformed {
            kind: "connect",
            reason: "shorter than id + port",
        });
    }
    let id = StreamId::new(body.get_u32());
    let port = (&body[body.len() - 2..]).get_u16();
    let host = body.slice(0..body.len() - 2);
    Ok(Message::Connect { id, host, port })
}

fn decode_connect_reply(mut body: Bytes) -> Result<Message, ProtoError> {
    if body.len() != 4 + 1 {
        return Err(ProtoError::Malformed {
            kind: "connect_reply",
            reason: "expected id + code",
        });
    }
    let id = StreamId::new(body.get_u32());
    let code = body.get_u8();
    Ok(Message::ConnectReply { id, code })
}

fn decode_data(mut body: Bytes, kind: &'static str) -> Result<(StreamId, Bytes), ProtoError> {
    if body.len() < 4 {
        return Err(ProtoError::Malformed {
            kind,
            reason: "shorter than id",
        });
    }
    let id = StreamId::new(body.get_u32());
    Ok((id, body))
}

fn decode_close(mut body: Bytes) -> Result<StreamId, ProtoError> {
    if body.len() != 4 {
        return Err(ProtoError::Malformed {
            kind: "close",
            reason: "expected bare id",
        });
    }
    Ok(StreamId::new(body.get_u32()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = msg.encode().freeze();
        let declared = u32::from_be_bytes(encoded[0..4].try_into().unwrap());
        assert_eq!(declared as usize, encoded.len());
        assert!(encoded.len() >= HEADER_LEN);
        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn connect_roundtrip() {
        roundtrip(Message::Connect {
            id: StreamId::new(42),
            host: Bytes::from_static(b"example.com"),
            port: 443,
        });
    }

    #[test]
    fn connect_reply_roundtrip() {
        roundtrip(Message::ConnectReply {
            id: StreamId::new(7),
            code: 1,
        });
    }

    #[test]
    fn data_out_roundtrip() {
        roundtrip(Message::DataOut {
            id: StreamId::new(9),
            data: Bytes::from_static(b"hello"),
        });
    }

    #[test]
    fn data_in_empty_payload_is_valid() {
        roundtrip(Message::DataIn {
            id: StreamId::new(1),
            data: Bytes::new(),
        });
    }

    #[test]
    fn close_messages_roundtrip() {
        roundtrip(Message::CloseLocal {
            id: StreamId::new(3),
        });
        roundtrip(Message::CloseRemote {
            id: StreamId::new(4),
        });
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(6);
        buf.put_u8(99);
        buf.put_u32(123);
        let err = Message::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownType(99)));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let buf = Bytes::from_static(&[0, 0, 0, 4]);
        let err = Message::decode(buf).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooShort(_)));
    }
}
