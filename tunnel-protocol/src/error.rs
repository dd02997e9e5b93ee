//! Errors produced while reading, writing, or decoding frames.

use thiserror::Error;

/// Maximum payload size accepted from the wire. Frames advertising a
/// larger length are rejected before the payload is even read.
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload length {0} exceeds max {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(u32),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("malformed payload for message type {0:?}: {1}")]
    BadPayload(crate::MessageType, bincode::Error),

    #[error("truncated frame")]
    Truncated,
}
