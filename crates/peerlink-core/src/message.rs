//! Outbound and inbound application messages.
//!
//! Outbound messages carry a status observable (a `watch` channel) that moves
//! forward only: `Unsent → Sent → Acknowledged | Rejected`. Inbound messages
//! carry a [`CompletionToken`] used to report the processing outcome back to
//! the sender.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
pub use peerlink_proto::PropertyValue;
use tokio::sync::watch;

use crate::{address::NetworkHostAndPort, error::MessageError, legal_name::LegalName};

/// Delivery status of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Not yet handed to a connection
    Unsent,
    /// Written to the peer, awaiting its disposition
    Sent,
    /// Peer accepted the message
    Acknowledged,
    /// Peer rejected the message or the connection closed first
    Rejected,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Unsent => 0,
            Self::Sent => 1,
            Self::Acknowledged | Self::Rejected => 2,
        }
    }

    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// Message to be sent to a peer.
#[derive(Debug)]
pub struct OutboundMessage {
    payload: Bytes,
    topic: String,
    destination_legal_name: String,
    destination: NetworkHostAndPort,
    properties: BTreeMap<String, PropertyValue>,
    status: Arc<watch::Sender<MessageStatus>>,
}

impl OutboundMessage {
    /// Create a message, rejecting payloads above `max_message_size`.
    pub fn new(
        payload: impl Into<Bytes>,
        topic: impl Into<String>,
        destination_legal_name: impl Into<String>,
        destination: NetworkHostAndPort,
        properties: BTreeMap<String, PropertyValue>,
        max_message_size: usize,
    ) -> Result<Self, MessageError> {
        let payload = payload.into();
        if payload.len() > max_message_size {
            return Err(MessageError::PayloadTooLarge {
                size: payload.len(),
                max: max_message_size,
            });
        }
        let (status, _) = watch::channel(MessageStatus::Unsent);

        Ok(Self {
            payload,
            topic: topic.into(),
            destination_legal_name: destination_legal_name.into(),
            destination,
            properties,
            status: Arc::new(status),
        })
    }

    /// Message body.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Destination topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Legal name of the addressee.
    pub fn destination_legal_name(&self) -> &str {
        &self.destination_legal_name
    }

    /// Network address of the addressee.
    pub fn destination(&self) -> &NetworkHostAndPort {
        &self.destination
    }

    /// Application properties.
    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Current status.
    pub fn status(&self) -> MessageStatus {
        *self.status.borrow()
    }

    /// Observe status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<MessageStatus> {
        self.status.subscribe()
    }

    /// Move the status forward. Backward or sideways moves are ignored.
    pub(crate) fn advance(&self, next: MessageStatus) {
        self.status.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

/// Receiver of completion reports for inbound messages.
pub trait CompletionSink: Send + Sync + fmt::Debug {
    /// Report the outcome of delivery `delivery_id`.
    fn complete(&self, delivery_id: u64, accepted: bool);
}

/// One-shot handle acknowledging an inbound message.
///
/// Clones share one outcome. If every clone is dropped without a call to
/// [`complete`](Self::complete) the delivery is reported as rejected, so a
/// message nobody received still settles on the sending side.
#[derive(Debug, Clone)]
pub struct CompletionToken(Arc<Completion>);

#[derive(Debug)]
struct Completion {
    delivery_id: u64,
    sink: Arc<dyn CompletionSink>,
    done: AtomicBool,
}

impl Completion {
    fn report(&self, accepted: bool) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.sink.complete(self.delivery_id, accepted);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.report(false);
    }
}

impl CompletionToken {
    /// Create a token reporting to `sink`.
    pub fn new(delivery_id: u64, sink: Arc<dyn CompletionSink>) -> Self {
        Self(Arc::new(Completion { delivery_id, sink, done: AtomicBool::new(false) }))
    }

    /// Report the outcome. Only the first call on any clone has an effect.
    pub fn complete(&self, accepted: bool) {
        self.0.report(accepted);
    }

    /// Whether the outcome has been reported.
    pub fn is_completed(&self) -> bool {
        self.0.done.load(Ordering::Acquire)
    }
}

/// Message received from a peer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Message body
    pub payload: Bytes,
    /// Destination topic
    pub topic: String,
    /// Legal name of the sender, from its certificate
    pub source_legal_name: Option<LegalName>,
    /// Network address of the sender
    pub source_address: NetworkHostAndPort,
    /// Legal name the sender addressed
    pub destination_legal_name: String,
    /// Local address the message arrived on
    pub destination_address: NetworkHostAndPort,
    /// Application properties
    pub properties: BTreeMap<String, PropertyValue>,
    token: CompletionToken,
}

impl InboundMessage {
    /// Assemble an inbound message.
    pub fn new(
        transfer: peerlink_proto::Transfer,
        source_legal_name: Option<LegalName>,
        source_address: NetworkHostAndPort,
        destination_address: NetworkHostAndPort,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        Self {
            payload: transfer.payload,
            topic: transfer.topic,
            source_legal_name,
            source_address,
            destination_legal_name: transfer.destination_legal_name,
            destination_address,
            properties: transfer.properties,
            token: CompletionToken::new(transfer.delivery_id, sink),
        }
    }

    /// Acknowledge processing. Completing twice is a no-op.
    pub fn complete(&self, accepted: bool) {
        self.token.complete(accepted);
    }

    /// Completion token, for handing the acknowledgement elsewhere.
    pub fn token(&self) -> &CompletionToken {
        &self.token
    }
}
