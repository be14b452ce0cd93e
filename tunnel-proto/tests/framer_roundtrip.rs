//! Integration-level check of testable property #1 (spec §8): for any
//! sequence of well-formed messages fed to the framer in arbitrary
//! byte-chunk splits, it emits exactly that sequence in order with no
//! residue.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tunnel_proto::{FrameCodec, Message, StreamId};

fn sample_messages() -> Vec<Message> {
    vec![
        Message::Connect {
            id: StreamId::new(1),
            host: Bytes::from_static(b"localhost"),
            port: 80,
        },
        Message::DataOut {
            id: StreamId::new(1),
            data: Bytes::from(vec![0xABu8; 4096]),
        },
        Message::DataIn {
            id: StreamId::new(1),
            data: Bytes::from_static(b"reply"),
        },
        Message::ConnectReply {
            id: StreamId::new(2),
            code: 1,
        },
        Message::CloseLocal {
            id: StreamId::new(1),
        },
        Message::CloseRemote {
            id: StreamId::new(2),
        },
    ]
}

fn feed_in_chunks(messages: &[Message], chunk_size: usize) -> Vec<Message> {
    let mut wire = BytesMut::new();
    for m in messages {
        wire.extend_from_slice(&m.encode());
    }
    let wire = wire.freeze();

    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::new();
    let mut out = Vec::new();
    for chunk in wire.chunks(chunk_size.max(1)) {
        buf.extend_from_slice(chunk);
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(Message::decode(frame).unwrap());
        }
    }
    assert!(buf.is_empty());
    out
}

#[test]
fn roundtrips_across_every_chunk_size() {
    let messages = sample_messages();
    for chunk_size in 1..=64 {
        let decoded = feed_in_chunks(&messages, chunk_size);
        assert_eq!(decoded, messages, "mismatch at chunk_size={chunk_size}");
    }
}

#[test]
fn every_emitted_frame_is_len_self_consistent() {
    for m in sample_messages() {
        let encoded = m.encode();
        assert!(encoded.len() >= 5);
        let declared = u32::from_be_bytes(encoded[0..4].try_into().unwrap());
        assert_eq!(declared as usize, encoded.len());
    }
}
