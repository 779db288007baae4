//! Incremental frame decoding.

use bytes::{Buf, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    frame::Frame,
    header::FrameHeader,
};

/// Splits a byte stream into frames.
///
/// Bytes are appended with [`push`](Self::push) in whatever chunks the
/// transport delivers; [`next_frame`](Self::next_frame) yields complete frames
/// in order. A header declaring a payload above the limit is reported as soon
/// as the header itself is complete.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_payload: usize,
}

impl FrameDecoder {
    /// Create a decoder rejecting payloads above `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self { buffer: BytesMut::new(), max_payload }
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if any.
    ///
    /// Errors are terminal: the decoder does not resynchronize.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let header = FrameHeader::from_bytes(&self.buffer)?;
        let size = header.payload_size() as usize;
        if size > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge { size, max: self.max_payload });
        }
        if self.buffer.len() < FrameHeader::SIZE + size {
            return Ok(None);
        }
        let Some(kind) = header.kind() else {
            return Err(ProtocolError::UnknownFrameKind(self.buffer[3]));
        };

        self.buffer.advance(FrameHeader::SIZE);
        let body = self.buffer.split_to(size);
        Frame::decode_body(kind, &body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::frame::{Close, Disposition, Open};

    fn encoded(frames: &[Frame]) -> BytesMut {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode(&mut buf, 1 << 20).unwrap();
        }
        buf
    }

    fn sample() -> Vec<Frame> {
        vec![
            Frame::Open(Open { container_id: "a".into(), credentials: None }),
            Frame::Disposition(Disposition { delivery_id: 1, accepted: true }),
            Frame::Close(Close { reason: Some("bye".into()) }),
        ]
    }

    #[test]
    fn partial_header_yields_nothing() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(b"PL");
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 2);
    }

    #[test]
    fn oversized_header_fails_before_body_arrives() {
        let mut decoder = FrameDecoder::new(16);
        let header = FrameHeader::new(crate::FrameKind::Transfer, 17);
        decoder.push(&header.to_bytes());
        assert_eq!(
            decoder.next_frame(),
            Err(ProtocolError::PayloadTooLarge { size: 17, max: 16 })
        );
    }

    proptest! {
        #[test]
        fn any_chunking_yields_same_frames(split in 1usize..64) {
            let frames = sample();
            let bytes = encoded(&frames);
            let mut decoder = FrameDecoder::new(1024);
            let mut out = Vec::new();

            for chunk in bytes.chunks(split) {
                decoder.push(chunk);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    out.push(frame);
                }
            }

            prop_assert_eq!(out, frames);
            prop_assert_eq!(decoder.buffered(), 0);
        }
    }
}
