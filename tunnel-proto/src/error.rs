use thiserror::Error;

/// Fatal-to-the-tunnel protocol errors.
///
/// Any of these abort the framing loop; the caller treats the tunnel as
/// dropped (spec §7: framing errors are connection-fatal, not per-stream).
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame length {0} exceeds maximum of {1} bytes")]
    FrameTooLarge(u32, u32),

    #[error("frame length {0} is smaller than the minimum 5 bytes")]
    FrameTooShort(u32),

    #[error("unknown message type tag {0}")]
    UnknownType(u8),

    #[error("malformed {kind} payload: {reason}")]
    Malformed {
        kind: &'static str,
        reason: &'static str,
    },

    #[error("hostname is not valid UTF-8")]
    InvalidHost,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
