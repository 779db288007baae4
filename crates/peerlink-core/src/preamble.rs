//! Preamble mode selector.
//!
//! A server port may serve both the encrypted protocol and a plaintext
//! liveness probe. The selector looks at the first bytes of a connection and
//! decides once, permanently:
//!
//! ```text
//!              prefix matches,            ┌──────┐
//!              phrase complete            │ Echo │  every byte is echoed
//!           ┌────────────────────────────>└──────┘
//! ┌───────────┐
//! │ Undecided │
//! └───────────┘  first differing byte     ┌────────┐
//!           └────────────────────────────>│ Normal │  buffered bytes replayed
//!                                         └────────┘  into TLS
//! ```
//!
//! A mismatch is reported at the first byte that differs from the phrase, so
//! a TLS ClientHello is never held back waiting for a full phrase.

use bytes::{Bytes, BytesMut};

/// Selector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    /// Still matching the phrase prefix
    Undecided,
    /// Probe detected, connection is an echo loop
    Echo,
    /// Not a probe, connection carries TLS
    Normal,
}

/// Outcome of feeding bytes to the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorDecision {
    /// Not enough bytes to decide
    NeedMore,
    /// Write these bytes back to the peer
    Echo(Bytes),
    /// Hand these bytes to the TLS layer, in order, before reading further
    Normal(Bytes),
}

/// Per-connection selector.
#[derive(Debug)]
pub struct ModeSelector {
    phrase: Bytes,
    buffer: BytesMut,
    state: SelectorState,
}

impl ModeSelector {
    /// Create a selector matching `phrase`.
    pub fn new(phrase: impl Into<Bytes>) -> Self {
        Self { phrase: phrase.into(), buffer: BytesMut::new(), state: SelectorState::Undecided }
    }

    /// Current state.
    pub fn state(&self) -> SelectorState {
        self.state
    }

    /// Feed bytes read from the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> SelectorDecision {
        match self.state {
            SelectorState::Echo => return SelectorDecision::Echo(Bytes::copy_from_slice(bytes)),
            SelectorState::Normal => {
                return SelectorDecision::Normal(Bytes::copy_from_slice(bytes));
            },
            SelectorState::Undecided => {},
        }

        self.buffer.extend_from_slice(bytes);
        let compared = self.buffer.len().min(self.phrase.len());
        if self.buffer[..compared] != self.phrase[..compared] {
            self.state = SelectorState::Normal;
            return SelectorDecision::Normal(self.buffer.split().freeze());
        }
        if self.buffer.len() >= self.phrase.len() {
            self.state = SelectorState::Echo;
            return SelectorDecision::Echo(self.buffer.split().freeze());
        }
        SelectorDecision::NeedMore
    }

    /// Bytes buffered while undecided.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const PHRASE: &[u8] = b"ISALIVE";

    #[test]
    fn byte_by_byte_probe_echoes_everything() {
        let mut selector = ModeSelector::new(PHRASE);
        for &b in &PHRASE[..PHRASE.len() - 1] {
            assert_eq!(selector.feed(&[b]), SelectorDecision::NeedMore);
        }
        assert_eq!(
            selector.feed(&PHRASE[PHRASE.len() - 1..]),
            SelectorDecision::Echo(Bytes::from_static(PHRASE))
        );
        assert_eq!(selector.feed(b"more"), SelectorDecision::Echo(Bytes::from_static(b"more")));
        assert_eq!(selector.state(), SelectorState::Echo);
    }

    #[test]
    fn extra_bytes_after_phrase_are_echoed_too() {
        let mut selector = ModeSelector::new(PHRASE);
        assert_eq!(
            selector.feed(b"ISALIVE?!"),
            SelectorDecision::Echo(Bytes::from_static(b"ISALIVE?!"))
        );
    }

    #[test]
    fn mismatch_detected_at_first_differing_byte() {
        let mut selector = ModeSelector::new(PHRASE);
        assert_eq!(selector.feed(b"I"), SelectorDecision::NeedMore);
        assert_eq!(selector.feed(b"x"), SelectorDecision::Normal(Bytes::from_static(b"Ix")));
        assert_eq!(selector.state(), SelectorState::Normal);
        assert!(selector.buffered().is_empty());
    }

    #[test]
    fn tls_record_is_normal_immediately() {
        let mut selector = ModeSelector::new(PHRASE);
        let hello = [0x16, 0x03, 0x01, 0x00, 0xc4];
        assert_eq!(selector.feed(&hello), SelectorDecision::Normal(Bytes::copy_from_slice(&hello)));
    }

    proptest! {
        #[test]
        fn non_probe_input_is_replayed_exactly(
            input in proptest::collection::vec(any::<u8>(), 1..64),
            split in 1usize..8,
        ) {
            prop_assume!(!input.starts_with(PHRASE) && !PHRASE.starts_with(&input));
            let mut selector = ModeSelector::new(PHRASE);
            let mut replayed = Vec::new();

            for chunk in input.chunks(split) {
                match selector.feed(chunk) {
                    SelectorDecision::NeedMore => {},
                    SelectorDecision::Normal(bytes) => replayed.extend_from_slice(&bytes),
                    SelectorDecision::Echo(_) => prop_assert!(false, "unexpected echo"),
                }
            }

            prop_assert_eq!(replayed, input);
        }
    }
}
