//! Shared plumbing for the split-tunnel SOCKS5 proxy: the tunnel wire
//! protocol, the length-prefixed framer, stream ids, the bounded DNS
//! cache, and mutual-TLS bootstrap. Consumed by both `local-proxy` and
//! `remote-proxy`.

pub mod cache;
pub mod codec;
pub mod error;
pub mod message;
pub mod stream_id;
pub mod tls;

pub use cache::BoundedCache;
pub use codec::{FrameCodec, MAX_FRAME_LEN};
pub use error::ProtoError;
pub use message::Message;
pub use stream_id::{StreamId, StreamIdAllocator};
pub use tls::TlsMaterial;
