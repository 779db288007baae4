//! Application protocol engine.
//!
//! Once a channel is authenticated it hands the decrypted byte stream to a
//! [`ProtocolEngine`]. The engine is Sans-IO: it consumes bytes and returns
//! events, and queues outgoing bytes until the channel calls
//! [`take_output`](ProtocolEngine::take_output).
//!
//! [`FramedEngine`] is the bundled engine speaking `peerlink-proto` frames:
//!
//! ```text
//! client                                  server
//!   │ Open{container, credentials} ──────>  │  credentials checked
//!   │ <────────────────────── Open{container}│
//!   │ Transfer{id} ───────────────────────> │
//!   │ <──────────────── Disposition{id, ok} │
//!   │ Close ──────────────────────────────> │
//! ```
//!
//! Both sides send `Open` as soon as the engine starts; a transfer arriving
//! before the peer's `Open` is a protocol violation.

use std::{collections::{BTreeMap, HashSet}, fmt, sync::Arc};

use bytes::{Bytes, BytesMut};
use peerlink_proto::{
    Close, Disposition, Frame, FrameDecoder, Open, PropertyValue, SaslPlain, Transfer,
};
use tracing::{debug, trace};

use crate::{channel::ChannelRole, config::Credentials, error::EngineError};

/// Room for topic, names and properties on top of the payload limit.
const FRAME_OVERHEAD: usize = 64 * 1024;

/// Event produced while consuming input.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A message arrived
    Received(Transfer),
    /// Peer settled one of our transfers
    Settled {
        /// Delivery settled
        delivery_id: u64,
        /// Peer's verdict
        accepted: bool,
    },
    /// Peer closed the engine
    RemoteClosed {
        /// Peer's reason, if any
        reason: Option<String>,
    },
}

/// Parameters for a new engine instance.
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Which side of the connection this engine runs on
    pub role: ChannelRole,
    /// Identifier sent in `Open`
    pub container_id: String,
    /// Client: sent in `Open`. Server: required in the peer's `Open`.
    pub credentials: Option<Credentials>,
    /// Largest accepted message payload
    pub max_message_size: usize,
}

/// Sans-IO application protocol.
pub trait ProtocolEngine: Send + fmt::Debug {
    /// Queue the opening frame.
    fn open(&mut self) -> Result<(), EngineError>;

    /// Consume decrypted bytes from the peer.
    fn on_input(&mut self, bytes: &[u8]) -> Result<Vec<EngineEvent>, EngineError>;

    /// Queue a message, returning its delivery id.
    fn transfer(
        &mut self,
        topic: &str,
        destination_legal_name: &str,
        properties: &BTreeMap<String, PropertyValue>,
        payload: Bytes,
    ) -> Result<u64, EngineError>;

    /// Queue the outcome of a received delivery.
    fn settle(&mut self, delivery_id: u64, accepted: bool) -> Result<(), EngineError>;

    /// Take queued outgoing bytes.
    fn take_output(&mut self) -> Option<Bytes>;

    /// Queue a close frame and stop accepting work.
    fn close(&mut self, reason: Option<&str>);

    /// Whether the engine was closed by either side.
    fn is_closed(&self) -> bool;
}

/// Creates engines for new channels.
pub trait EngineFactory: Send + Sync + fmt::Debug {
    /// Create an engine.
    fn create(&self, params: EngineParams) -> Box<dyn ProtocolEngine>;
}

/// Factory for [`FramedEngine`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedEngineFactory;

impl FramedEngineFactory {
    /// Shared factory instance.
    pub fn shared() -> Arc<dyn EngineFactory> {
        Arc::new(Self)
    }
}

impl EngineFactory for FramedEngineFactory {
    fn create(&self, params: EngineParams) -> Box<dyn ProtocolEngine> {
        Box::new(FramedEngine::new(params))
    }
}

/// Engine over `peerlink-proto` frames.
#[derive(Debug)]
pub struct FramedEngine {
    params: EngineParams,
    decoder: FrameDecoder,
    output: BytesMut,
    next_delivery: u64,
    unsettled: HashSet<u64>,
    opened: bool,
    remote_opened: bool,
    closed: bool,
}

impl FramedEngine {
    /// Create an engine.
    pub fn new(params: EngineParams) -> Self {
        let decoder = FrameDecoder::new(params.max_message_size.saturating_add(FRAME_OVERHEAD));
        Self {
            params,
            decoder,
            output: BytesMut::new(),
            next_delivery: 0,
            unsettled: HashSet::new(),
            opened: false,
            remote_opened: false,
            closed: false,
        }
    }

    fn frame_limit(&self) -> usize {
        self.params.max_message_size.saturating_add(FRAME_OVERHEAD)
    }

    fn write(&mut self, frame: &Frame) -> Result<(), EngineError> {
        let limit = self.frame_limit();
        frame.encode(&mut self.output, limit)?;
        trace!(kind = ?frame.kind(), "queued frame");
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame, events: &mut Vec<EngineEvent>) -> Result<(), EngineError> {
        match frame {
            Frame::Open(open) => {
                if self.remote_opened {
                    return Err(EngineError::Violation("duplicate open".into()));
                }
                if self.params.role == ChannelRole::Server {
                    check_credentials(self.params.credentials.as_ref(), open.credentials.as_ref())?;
                }
                debug!(container = %open.container_id, "peer opened engine");
                self.remote_opened = true;
            },
            Frame::Transfer(transfer) => {
                if !self.remote_opened {
                    return Err(EngineError::Violation("transfer before open".into()));
                }
                if transfer.payload.len() > self.params.max_message_size {
                    return Err(EngineError::MessageTooLarge {
                        size: transfer.payload.len(),
                        max: self.params.max_message_size,
                    });
                }
                events.push(EngineEvent::Received(transfer));
            },
            Frame::Disposition(Disposition { delivery_id, accepted }) => {
                if self.unsettled.remove(&delivery_id) {
                    events.push(EngineEvent::Settled { delivery_id, accepted });
                } else {
                    debug!(delivery_id, "disposition for unknown delivery");
                }
            },
            Frame::Close(Close { reason }) => {
                self.closed = true;
                events.push(EngineEvent::RemoteClosed { reason });
            },
        }
        Ok(())
    }
}

fn check_credentials(
    expected: Option<&Credentials>,
    presented: Option<&SaslPlain>,
) -> Result<(), EngineError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match presented {
        Some(p) if p.username == expected.username && p.password == expected.password => Ok(()),
        Some(p) => Err(EngineError::AuthenticationFailed(p.username.clone())),
        None => Err(EngineError::AuthenticationFailed(String::new())),
    }
}

impl ProtocolEngine for FramedEngine {
    fn open(&mut self) -> Result<(), EngineError> {
        if self.opened {
            return Ok(());
        }
        let credentials = match self.params.role {
            ChannelRole::Client => self
                .params
                .credentials
                .as_ref()
                .map(|c| SaslPlain { username: c.username.clone(), password: c.password.clone() }),
            ChannelRole::Server => None,
        };
        let open =
            Frame::Open(Open { container_id: self.params.container_id.clone(), credentials });
        self.write(&open)?;
        self.opened = true;
        Ok(())
    }

    fn on_input(&mut self, bytes: &[u8]) -> Result<Vec<EngineEvent>, EngineError> {
        if self.closed {
            return Ok(Vec::new());
        }
        self.decoder.push(bytes);
        let mut events = Vec::new();
        while let Some(frame) = self.decoder.next_frame()? {
            self.on_frame(frame, &mut events)?;
            if self.closed {
                break;
            }
        }
        Ok(events)
    }

    fn transfer(
        &mut self,
        topic: &str,
        destination_legal_name: &str,
        properties: &BTreeMap<String, PropertyValue>,
        payload: Bytes,
    ) -> Result<u64, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        if payload.len() > self.params.max_message_size {
            return Err(EngineError::MessageTooLarge {
                size: payload.len(),
                max: self.params.max_message_size,
            });
        }
        let delivery_id = self.next_delivery;
        self.write(&Frame::Transfer(Transfer {
            delivery_id,
            topic: topic.to_string(),
            destination_legal_name: destination_legal_name.to_string(),
            properties: properties.clone(),
            payload,
        }))?;
        self.next_delivery += 1;
        self.unsettled.insert(delivery_id);
        Ok(delivery_id)
    }

    fn settle(&mut self, delivery_id: u64, accepted: bool) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        self.write(&Frame::Disposition(Disposition { delivery_id, accepted }))
    }

    fn take_output(&mut self) -> Option<Bytes> {
        if self.output.is_empty() { None } else { Some(self.output.split().freeze()) }
    }

    fn close(&mut self, reason: Option<&str>) {
        if self.closed {
            return;
        }
        self.closed = true;
        let close = Frame::Close(Close { reason: reason.map(str::to_string) });
        if let Err(e) = self.write(&close) {
            debug!(error = %e, "failed to queue close frame");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(role: ChannelRole, credentials: Option<Credentials>) -> EngineParams {
        EngineParams {
            role,
            container_id: format!("{role:?}"),
            credentials,
            max_message_size: 1024,
        }
    }

    fn creds(password: &str) -> Credentials {
        Credentials { username: "peer".into(), password: password.into() }
    }

    fn pump(
        from: &mut FramedEngine,
        to: &mut FramedEngine,
    ) -> Result<Vec<EngineEvent>, EngineError> {
        match from.take_output() {
            Some(bytes) => to.on_input(&bytes),
            None => Ok(Vec::new()),
        }
    }

    fn opened_pair() -> (FramedEngine, FramedEngine) {
        let mut client = FramedEngine::new(params(ChannelRole::Client, Some(creds("pw"))));
        let mut server = FramedEngine::new(params(ChannelRole::Server, Some(creds("pw"))));
        client.open().unwrap();
        server.open().unwrap();
        assert!(pump(&mut client, &mut server).unwrap().is_empty());
        assert!(pump(&mut server, &mut client).unwrap().is_empty());
        (client, server)
    }

    #[test]
    fn transfer_and_settle() {
        let (mut client, mut server) = opened_pair();

        let id = client
            .transfer("topic", "O=B,L=L,C=GB", &BTreeMap::new(), Bytes::from_static(b"hi"))
            .unwrap();
        let events = pump(&mut client, &mut server).unwrap();
        let [EngineEvent::Received(transfer)] = events.as_slice() else {
            panic!("expected one transfer, got {events:?}");
        };
        assert_eq!(transfer.delivery_id, id);
        assert_eq!(transfer.payload, Bytes::from_static(b"hi"));

        server.settle(id, true).unwrap();
        let events = pump(&mut server, &mut client).unwrap();
        assert_eq!(events, vec![EngineEvent::Settled { delivery_id: id, accepted: true }]);
    }

    #[test]
    fn wrong_credentials_fail_on_server() {
        let mut client = FramedEngine::new(params(ChannelRole::Client, Some(creds("bad"))));
        let mut server = FramedEngine::new(params(ChannelRole::Server, Some(creds("pw"))));
        client.open().unwrap();
        assert_eq!(
            pump(&mut client, &mut server),
            Err(EngineError::AuthenticationFailed("peer".into()))
        );
    }

    #[test]
    fn transfer_before_open_is_a_violation() {
        let mut client = FramedEngine::new(params(ChannelRole::Client, None));
        let mut server = FramedEngine::new(params(ChannelRole::Server, None));
        client.remote_opened = true;
        client.transfer("t", "n", &BTreeMap::new(), Bytes::from_static(b"x")).unwrap();
        assert!(matches!(pump(&mut client, &mut server), Err(EngineError::Violation(_))));
    }

    #[test]
    fn oversized_inbound_transfer_is_rejected() {
        let (mut client, mut server) = opened_pair();
        client.params.max_message_size = 4096;
        client.transfer("t", "n", &BTreeMap::new(), Bytes::from(vec![0u8; 2048])).unwrap();
        assert!(matches!(
            pump(&mut client, &mut server),
            Err(EngineError::MessageTooLarge { size: 2048, max: 1024 })
        ));
    }

    #[test]
    fn close_is_sent_once_and_reported() {
        let (mut client, mut server) = opened_pair();
        client.close(Some("done"));
        client.close(Some("again"));
        let events = pump(&mut client, &mut server).unwrap();
        assert_eq!(events, vec![EngineEvent::RemoteClosed { reason: Some("done".into()) }]);
        assert!(server.is_closed());
        assert_eq!(
            client.transfer("t", "n", &BTreeMap::new(), Bytes::new()),
            Err(EngineError::Closed)
        );
    }
}
