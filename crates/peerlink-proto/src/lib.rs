//! Wire format for the Peerlink message engine.
//!
//! Frames consist of a fixed 8-byte header (zero-copy binary) followed by a
//! variable-length CBOR payload. The header carries the frame kind and the
//! payload length so a receiver can split the encrypted byte stream into
//! frames without touching the payload.
//!
//! The frame set is deliberately small: a connection opens with [`Open`],
//! carries messages as [`Transfer`] frames, acknowledges them with
//! [`Disposition`] frames and ends with [`Close`].
//!
//! # Security
//!
//! Header parsing uses compile-time verified layouts via `zerocopy`. Every
//! decoder is constructed with a maximum payload size, and frames above it are
//! rejected before the payload is buffered.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod errors;
pub mod frame;
pub mod header;

pub use codec::FrameDecoder;
pub use errors::{ProtocolError, Result};
pub use frame::{Close, Disposition, Frame, Open, PropertyValue, SaslPlain, Transfer};
pub use header::{FrameHeader, FrameKind};
