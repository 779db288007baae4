//! Error types for frame encoding and decoding.

use thiserror::Error;

/// Result alias for frame operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Header did not start with the frame magic.
    #[error("invalid frame magic {0:02x?}")]
    InvalidMagic([u8; 2]),

    /// Header version is not supported by this decoder.
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    /// Header names a frame kind this decoder does not know.
    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),

    /// Payload exceeds the negotiated maximum.
    #[error("frame payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Declared or encoded payload size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Input was shorter than a frame header.
    #[error("truncated frame header: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// CBOR serialization failed.
    #[error("failed to encode frame payload: {0}")]
    Encode(String),

    /// CBOR deserialization failed or the payload did not match the header kind.
    #[error("failed to decode frame payload: {0}")]
    Decode(String),
}
