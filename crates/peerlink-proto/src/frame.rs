//! Frame types carried after the header.
//!
//! Each frame kind has a CBOR-encoded body. [`Frame::encode`] writes the
//! header and body in one go; decoding is done incrementally by
//! [`FrameDecoder`](crate::FrameDecoder).

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    errors::{ProtocolError, Result},
    header::{FrameHeader, FrameKind},
};

/// Plaintext username/password pair presented when a connection opens.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslPlain {
    /// Account name
    pub username: String,
    /// Account secret
    pub password: String,
}

impl std::fmt::Debug for SaslPlain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslPlain")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// First frame each side sends once the encrypted channel is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Open {
    /// Free-form identifier of the sending container
    pub container_id: String,
    /// Credentials, sent by clients that have them configured
    pub credentials: Option<SaslPlain>,
}

/// Typed application property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Opaque bytes
    Bytes(Bytes),
}

/// A single application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    /// Sender-assigned delivery number, echoed in the matching [`Disposition`]
    pub delivery_id: u64,
    /// Destination topic or queue
    pub topic: String,
    /// Legal name of the node the message is addressed to
    pub destination_legal_name: String,
    /// Application properties
    pub properties: BTreeMap<String, PropertyValue>,
    /// Message body
    pub payload: Bytes,
}

/// Outcome of a previously received [`Transfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
    /// Delivery being settled
    pub delivery_id: u64,
    /// Whether the receiver accepted the message
    pub accepted: bool,
}

/// Orderly close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    /// Human-readable reason, if any
    pub reason: Option<String>,
}

/// Any frame of the engine protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Connection open
    Open(Open),
    /// Message transfer
    Transfer(Transfer),
    /// Delivery outcome
    Disposition(Disposition),
    /// Orderly close
    Close(Close),
}

impl Frame {
    /// Header kind for this frame.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Open(_) => FrameKind::Open,
            Self::Transfer(_) => FrameKind::Transfer,
            Self::Disposition(_) => FrameKind::Disposition,
            Self::Close(_) => FrameKind::Close,
        }
    }

    /// Encode header and body into `dst`.
    ///
    /// Fails with [`ProtocolError::PayloadTooLarge`] if the encoded body is
    /// above `max_payload`.
    pub fn encode(&self, dst: &mut BytesMut, max_payload: usize) -> Result<()> {
        let mut body = Vec::new();
        let written = match self {
            Self::Open(open) => ciborium::into_writer(open, &mut body),
            Self::Transfer(transfer) => ciborium::into_writer(transfer, &mut body),
            Self::Disposition(disposition) => ciborium::into_writer(disposition, &mut body),
            Self::Close(close) => ciborium::into_writer(close, &mut body),
        };
        written.map_err(|e| ProtocolError::Encode(e.to_string()))?;

        if body.len() > max_payload {
            return Err(ProtocolError::PayloadTooLarge { size: body.len(), max: max_payload });
        }
        let size = u32::try_from(body.len())
            .map_err(|_| ProtocolError::PayloadTooLarge { size: body.len(), max: max_payload })?;

        dst.reserve(FrameHeader::SIZE + body.len());
        dst.put_slice(&FrameHeader::new(self.kind(), size).to_bytes());
        dst.put_slice(&body);
        Ok(())
    }

    /// Decode a body of the given kind.
    pub fn decode_body(kind: FrameKind, body: &[u8]) -> Result<Self> {
        Ok(match kind {
            FrameKind::Open => Self::Open(from_cbor(body)?),
            FrameKind::Transfer => Self::Transfer(from_cbor(body)?),
            FrameKind::Disposition => Self::Disposition(from_cbor(body)?),
            FrameKind::Close => Self::Close(from_cbor(body)?),
        })
    }
}

fn from_cbor<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    ciborium::from_reader(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(payload: &[u8]) -> Frame {
        let mut properties = BTreeMap::new();
        properties.insert("priority".to_string(), PropertyValue::Int(3));
        properties.insert("tag".to_string(), PropertyValue::String("x".into()));
        Frame::Transfer(Transfer {
            delivery_id: 7,
            topic: "p2p.inbound".into(),
            destination_legal_name: "O=Bob,L=London,C=GB".into(),
            properties,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    #[test]
    fn encode_writes_header_then_body() {
        let mut buf = BytesMut::new();
        transfer(b"hello").encode(&mut buf, 1024).unwrap();

        let header = FrameHeader::from_bytes(&buf).unwrap();
        assert_eq!(header.kind(), Some(FrameKind::Transfer));
        assert_eq!(header.payload_size() as usize, buf.len() - FrameHeader::SIZE);

        let decoded =
            Frame::decode_body(FrameKind::Transfer, &buf[FrameHeader::SIZE..]).unwrap();
        assert_eq!(decoded, transfer(b"hello"));
    }

    #[test]
    fn encode_rejects_oversized_body() {
        let mut buf = BytesMut::new();
        let result = transfer(&[0u8; 512]).encode(&mut buf, 64);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { max: 64, .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_body_of_wrong_kind_fails() {
        let mut buf = BytesMut::new();
        Frame::Close(Close { reason: None }).encode(&mut buf, 1024).unwrap();
        let result = Frame::decode_body(FrameKind::Transfer, &buf[FrameHeader::SIZE..]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn credentials_are_redacted_in_debug() {
        let open = Open {
            container_id: "node".into(),
            credentials: Some(SaslPlain { username: "u".into(), password: "hunter2".into() }),
        };
        assert!(!format!("{open:?}").contains("hunter2"));
    }
}
