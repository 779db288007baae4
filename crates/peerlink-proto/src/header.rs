//! Fixed-size frame header.
//!
//! ```text
//! 0        2         3        4                 8
//! ┌────────┬─────────┬────────┬─────────────────┐
//! │ magic  │ version │  kind  │ payload size BE │
//! └────────┴─────────┴────────┴─────────────────┘
//! ```

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    byteorder::{BigEndian, U32},
};

use crate::errors::{ProtocolError, Result};

/// Kind of frame carried after a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Connection open, optionally carrying credentials
    Open = 1,
    /// Message transfer
    Transfer = 2,
    /// Delivery outcome for a transfer
    Disposition = 3,
    /// Orderly connection close
    Close = 4,
}

impl FrameKind {
    /// Convert a raw header byte into a frame kind.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Open),
            2 => Some(Self::Transfer),
            3 => Some(Self::Disposition),
            4 => Some(Self::Close),
            _ => None,
        }
    }

    /// Raw header byte for this kind.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Frame header with a compile-time verified layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FrameHeader {
    magic: [u8; 2],
    version: u8,
    kind: u8,
    payload_size: U32<BigEndian>,
}

impl FrameHeader {
    /// Encoded header size in bytes.
    pub const SIZE: usize = 8;

    /// Magic bytes opening every frame.
    pub const MAGIC: [u8; 2] = *b"PL";

    /// Current header version.
    pub const VERSION: u8 = 1;

    /// Create a header for a payload of `payload_size` bytes.
    pub fn new(kind: FrameKind, payload_size: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            kind: kind.to_u8(),
            payload_size: U32::new(payload_size),
        }
    }

    /// Parse and validate a header from the first [`Self::SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw = bytes.get(..Self::SIZE).ok_or(ProtocolError::Truncated {
            expected: Self::SIZE,
            actual: bytes.len(),
        })?;
        let header = Self::read_from_bytes(raw)
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: raw.len() })?;

        if header.magic != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic(header.magic));
        }
        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        if FrameKind::from_u8(header.kind).is_none() {
            return Err(ProtocolError::UnknownFrameKind(header.kind));
        }

        Ok(header)
    }

    /// Frame kind, if known.
    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_u8(self.kind)
    }

    /// Declared payload length.
    pub fn payload_size(&self) -> u32 {
        self.payload_size.get()
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}
