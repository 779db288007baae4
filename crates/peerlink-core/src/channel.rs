//! Connection channel state machine.
//!
//! One channel exists per TCP connection that reached the TLS layer. It
//! classifies the handshake outcome, owns the protocol engine once the peer
//! is authenticated, relays messages in both directions and guarantees that
//! exactly one disconnect event is emitted however the connection ends.
//!
//! # Architecture: Action-Based State Machine
//!
//! Methods take an event and return `Vec<ChannelAction>`; the driver in
//! `peerlink-transport` performs the writes, deliveries, event emission and
//! socket close. The channel never touches I/O.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐ begin_handshake ┌─────────────────────┐ handshake_completed ┌───────────────┐
//! │ Active │────────────────>│ HandshakeInProgress │────────────────────>│ Authenticated │
//! └────────┘                 └─────────────────────┘                     └───────┬───────┘
//!      │                        │ handshake_failed / bad certificate             │ engine open
//!      │ close                  ↓                                                ↓
//!      │                   ┌────────┐            close / engine error    ┌───────────────┐
//!      └──────────────────>│ Closed │<───────────────────────────────────│ EngineRunning │
//!                          └────────┘                                    └───────────────┘
//! ```
//!
//! Transitions are monotonic: no state is ever re-entered.

use std::{collections::{HashMap, HashSet}, fmt, sync::Arc};

use bytes::Bytes;
use rustls::pki_types::CertificateDer;
use tracing::{debug, info, trace, warn};

use crate::{
    address::NetworkHostAndPort,
    config::Credentials,
    engine::{EngineEvent, EngineFactory, EngineParams, ProtocolEngine},
    error::ChannelError,
    legal_name::LegalName,
    message::{CompletionSink, InboundMessage, MessageStatus, OutboundMessage},
};

/// Side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Initiated the TCP connection
    Client,
    /// Accepted the TCP connection
    Server,
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Connected at TCP level, handshake not started
    Active,
    /// TLS handshake running
    HandshakeInProgress,
    /// Handshake done and peer allow-listed
    Authenticated,
    /// Protocol engine relaying messages
    EngineRunning,
    /// Terminal
    Closed,
}

/// Why a connection change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionResult {
    /// Peer authenticated and engine started
    Connected,
    /// Previously connected channel closed
    Closed,
    /// Handshake failed or was abandoned
    HandshakeFailure,
    /// Peer identity is not in the allow-list
    BadCertificate,
}

/// Connect or disconnect notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChange {
    /// Peer network address
    pub remote_address: NetworkHostAndPort,
    /// Peer leaf certificate, when the handshake got that far
    pub peer_certificate: Option<CertificateDer<'static>>,
    /// Peer legal name, when the certificate subject parsed
    pub peer_legal_name: Option<LegalName>,
    /// `true` for a connect, `false` for a disconnect
    pub connected: bool,
    /// Classification
    pub result: ConnectionResult,
}

/// Handshake facts passed in by the driver.
#[derive(Debug, Clone, Default)]
pub struct HandshakeOutcome {
    /// Local chain presented, leaf first
    pub local_chain: Vec<CertificateDer<'static>>,
    /// Peer chain received, leaf first
    pub peer_chain: Vec<CertificateDer<'static>>,
    /// Local alias selected for the handshake
    pub alias: Option<String>,
}

/// Input to an established channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Decrypted bytes from the peer
    Input(Bytes),
    /// Outbound message to relay
    Send(OutboundMessage),
    /// Local processing outcome for an inbound delivery
    Complete {
        /// Delivery being completed
        delivery_id: u64,
        /// Whether the message was accepted
        accepted: bool,
    },
}

/// Action for the driver to execute, in order.
#[derive(Debug, Clone)]
pub enum ChannelAction {
    /// Write bytes to the encrypted stream
    Write(Bytes),
    /// Deliver an inbound message to subscribers
    Deliver(InboundMessage),
    /// Publish a connection change
    Emit(ConnectionChange),
    /// Close the socket
    Close {
        /// Reason, for logging
        reason: String,
    },
}

/// Fixed context of a channel.
#[derive(Clone)]
pub struct ChannelContext {
    /// Side of the connection
    pub role: ChannelRole,
    /// Peer address
    pub remote_address: NetworkHostAndPort,
    /// Local address
    pub local_address: NetworkHostAndPort,
    /// Accepted peer names; `None` accepts any authenticated peer
    pub allowed_remote_legal_names: Option<HashSet<LegalName>>,
    /// Largest message payload
    pub max_message_size: usize,
    /// Engine credentials
    pub credentials: Option<Credentials>,
    /// Log per-frame traffic at debug
    pub trace: bool,
    /// Log lifecycle at debug instead of info
    pub silenced: bool,
    /// Creates the protocol engine
    pub engine_factory: Arc<dyn EngineFactory>,
    /// Receives completion reports from inbound messages
    pub completion_sink: Arc<dyn CompletionSink>,
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("role", &self.role)
            .field("remote_address", &self.remote_address)
            .field("local_address", &self.local_address)
            .field("allowed_remote_legal_names", &self.allowed_remote_legal_names)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

/// Per-connection state machine.
#[derive(Debug)]
pub struct ConnectionChannel {
    context: ChannelContext,
    state: ChannelState,
    engine: Option<Box<dyn ProtocolEngine>>,
    peer_certificate: Option<CertificateDer<'static>>,
    peer_legal_name: Option<LegalName>,
    local_certificate: Option<CertificateDer<'static>>,
    alias: Option<String>,
    pending: HashMap<u64, OutboundMessage>,
    outcome: Option<ConnectionResult>,
}

impl ConnectionChannel {
    /// Create a channel in `Active` state.
    pub fn new(context: ChannelContext) -> Self {
        Self {
            context,
            state: ChannelState::Active,
            engine: None,
            peer_certificate: None,
            peer_legal_name: None,
            local_certificate: None,
            alias: None,
            pending: HashMap::new(),
            outcome: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Fixed context.
    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    /// Peer legal name, once known.
    pub fn peer_legal_name(&self) -> Option<&LegalName> {
        self.peer_legal_name.as_ref()
    }

    /// Local leaf certificate presented, once known.
    pub fn local_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.local_certificate.as_ref()
    }

    /// Local alias used for the handshake, once known.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Result of the last connection change emitted.
    pub fn outcome(&self) -> Option<ConnectionResult> {
        self.outcome
    }

    /// Number of outbound messages awaiting a disposition.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Enter `HandshakeInProgress`.
    pub fn begin_handshake(&mut self) -> Result<(), ChannelError> {
        if self.state != ChannelState::Active {
            return Err(ChannelError::InvalidState {
                state: self.state,
                operation: "begin_handshake",
            });
        }
        self.state = ChannelState::HandshakeInProgress;
        Ok(())
    }

    /// Classify a completed TLS handshake and, if the peer is acceptable,
    /// start the engine.
    pub fn handshake_completed(
        &mut self,
        outcome: HandshakeOutcome,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        if self.state != ChannelState::HandshakeInProgress {
            return Err(ChannelError::InvalidState {
                state: self.state,
                operation: "handshake_completed",
            });
        }

        self.local_certificate = outcome.local_chain.into_iter().next();
        self.alias = outcome.alias;
        let Some(peer) = outcome.peer_chain.into_iter().next() else {
            return Ok(
                self.fail(ConnectionResult::HandshakeFailure, "peer presented no certificate")
            );
        };
        self.peer_certificate = Some(peer.clone());

        let name = match LegalName::from_certificate(&peer) {
            Ok(name) => name,
            Err(e) => {
                warn!(
                    remote = %self.context.remote_address,
                    error = %e,
                    "peer certificate subject is not a legal name"
                );
                return Ok(self.fail(ConnectionResult::HandshakeFailure, "invalid peer legal name"));
            },
        };
        self.peer_legal_name = Some(name.clone());

        if let Some(allowed) = &self.context.allowed_remote_legal_names {
            if !allowed.contains(&name) {
                warn!(
                    remote = %self.context.remote_address,
                    legal_name = %name,
                    "peer legal name is not in the allowed set"
                );
                return Ok(
                    self.fail(ConnectionResult::BadCertificate, "unexpected peer legal name")
                );
            }
        }

        self.state = ChannelState::Authenticated;
        self.lifecycle("peer authenticated");

        let mut engine = self.context.engine_factory.create(EngineParams {
            role: self.context.role,
            container_id: self.context.local_address.to_string(),
            credentials: self.context.credentials.clone(),
            max_message_size: self.context.max_message_size,
        });
        if let Err(e) = engine.open() {
            return Ok(self.fail(ConnectionResult::HandshakeFailure, &e.to_string()));
        }
        let output = engine.take_output();
        self.engine = Some(engine);
        self.state = ChannelState::EngineRunning;
        self.outcome = Some(ConnectionResult::Connected);

        let mut actions = vec![ChannelAction::Emit(self.change(true, ConnectionResult::Connected))];
        actions.extend(output.map(ChannelAction::Write));
        Ok(actions)
    }

    /// Record a failed TLS handshake.
    pub fn handshake_failed(&mut self, reason: &str) -> Vec<ChannelAction> {
        if self.state == ChannelState::Closed {
            return Vec::new();
        }
        self.fail(ConnectionResult::HandshakeFailure, reason)
    }

    /// Dispatch an event on an established channel. Pending engine output
    /// is written after every event.
    pub fn handle(&mut self, event: ChannelEvent) -> Vec<ChannelAction> {
        if self.state != ChannelState::EngineRunning {
            if let ChannelEvent::Send(message) = event {
                debug!(
                    remote = %self.context.remote_address,
                    state = ?self.state,
                    "rejecting message on inactive channel"
                );
                message.advance(MessageStatus::Rejected);
            }
            return Vec::new();
        }

        let mut actions = Vec::new();
        let result = match event {
            ChannelEvent::Input(bytes) => self.on_input(&bytes, &mut actions),
            ChannelEvent::Send(message) => {
                self.on_send(message);
                Ok(())
            },
            ChannelEvent::Complete { delivery_id, accepted } => {
                self.with_engine(|engine| engine.settle(delivery_id, accepted))
            },
        };

        if let Some(bytes) = self.engine.as_mut().and_then(|engine| engine.take_output()) {
            actions.push(ChannelAction::Write(bytes));
        }
        if let Err(reason) = result {
            actions.extend(self.close(&reason));
        }
        actions
    }

    /// Close the channel. Emits exactly one disconnect over the channel's
    /// lifetime; later calls return nothing.
    pub fn close(&mut self, reason: &str) -> Vec<ChannelAction> {
        match self.state {
            ChannelState::Closed => Vec::new(),
            ChannelState::Active | ChannelState::HandshakeInProgress => {
                self.fail(ConnectionResult::HandshakeFailure, reason)
            },
            ChannelState::Authenticated | ChannelState::EngineRunning => {
                let mut actions = Vec::new();
                if let Some(mut engine) = self.engine.take() {
                    engine.close(Some(reason));
                    actions.extend(engine.take_output().map(ChannelAction::Write));
                }
                self.reject_pending();
                self.state = ChannelState::Closed;
                self.outcome = Some(ConnectionResult::Closed);
                self.lifecycle("channel closed");
                actions.push(ChannelAction::Emit(self.change(false, ConnectionResult::Closed)));
                actions.push(ChannelAction::Close { reason: reason.to_string() });
                actions
            },
        }
    }

    fn on_input(&mut self, bytes: &[u8], actions: &mut Vec<ChannelAction>) -> Result<(), String> {
        let events = self.with_engine(|engine| engine.on_input(bytes))?;
        for event in events {
            match event {
                EngineEvent::Received(transfer) => {
                    self.traffic("received message", transfer.delivery_id, transfer.payload.len());
                    actions.push(ChannelAction::Deliver(InboundMessage::new(
                        transfer,
                        self.peer_legal_name.clone(),
                        self.context.remote_address.clone(),
                        self.context.local_address.clone(),
                        Arc::clone(&self.context.completion_sink),
                    )));
                },
                EngineEvent::Settled { delivery_id, accepted } => {
                    if let Some(message) = self.pending.remove(&delivery_id) {
                        let status = if accepted {
                            MessageStatus::Acknowledged
                        } else {
                            MessageStatus::Rejected
                        };
                        message.advance(status);
                    }
                },
                EngineEvent::RemoteClosed { reason } => {
                    return Err(reason.unwrap_or_else(|| "closed by peer".to_string()));
                },
            }
        }
        Ok(())
    }

    fn on_send(&mut self, message: OutboundMessage) {
        let sent = self.engine.as_mut().map(|engine| {
            engine.transfer(
                message.topic(),
                message.destination_legal_name(),
                message.properties(),
                message.payload().clone(),
            )
        });
        match sent {
            Some(Ok(delivery_id)) => {
                self.traffic("sent message", delivery_id, message.payload().len());
                message.advance(MessageStatus::Sent);
                self.pending.insert(delivery_id, message);
            },
            Some(Err(e)) => {
                debug!(remote = %self.context.remote_address, error = %e, "engine refused message");
                message.advance(MessageStatus::Rejected);
            },
            None => message.advance(MessageStatus::Rejected),
        }
    }

    fn with_engine<T>(
        &mut self,
        f: impl FnOnce(&mut dyn ProtocolEngine) -> Result<T, crate::error::EngineError>,
    ) -> Result<T, String> {
        let engine = self.engine.as_deref_mut().ok_or_else(|| "engine released".to_string())?;
        f(engine).map_err(|e| e.to_string())
    }

    fn fail(&mut self, result: ConnectionResult, reason: &str) -> Vec<ChannelAction> {
        self.engine = None;
        self.reject_pending();
        self.state = ChannelState::Closed;
        self.outcome = Some(result);
        self.lifecycle(reason);
        vec![
            ChannelAction::Emit(self.change(false, result)),
            ChannelAction::Close { reason: reason.to_string() },
        ]
    }

    fn reject_pending(&mut self) {
        for (_, message) in self.pending.drain() {
            message.advance(MessageStatus::Rejected);
        }
    }

    fn change(&self, connected: bool, result: ConnectionResult) -> ConnectionChange {
        ConnectionChange {
            remote_address: self.context.remote_address.clone(),
            peer_certificate: self.peer_certificate.clone(),
            peer_legal_name: self.peer_legal_name.clone(),
            connected,
            result,
        }
    }

    fn lifecycle(&self, message: &str) {
        let remote = &self.context.remote_address;
        let legal_name = self.peer_legal_name.as_ref().map(ToString::to_string);
        let legal_name = legal_name.as_deref();
        if self.context.silenced {
            debug!(
                %remote,
                legal_name,
                alias = self.alias.as_deref(),
                state = ?self.state,
                "{message}"
            );
        } else {
            info!(
                %remote,
                legal_name,
                alias = self.alias.as_deref(),
                state = ?self.state,
                "{message}"
            );
        }
    }

    fn traffic(&self, message: &str, delivery_id: u64, size: usize) {
        let remote = &self.context.remote_address;
        if self.context.trace {
            debug!(%remote, delivery_id, size, "{message}");
        } else {
            trace!(%remote, delivery_id, size, "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    use super::*;
    use crate::engine::{FramedEngine, FramedEngineFactory};

    #[derive(Debug, Default)]
    struct Completions(Mutex<Vec<(u64, bool)>>);

    impl CompletionSink for Completions {
        fn complete(&self, delivery_id: u64, accepted: bool) {
            self.0.lock().unwrap().push((delivery_id, accepted));
        }
    }

    fn cert(org: &str) -> CertificateDer<'static> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, org);
        dn.push(DnType::LocalityName, "London");
        dn.push(DnType::CountryName, "GB");
        params.distinguished_name = dn;
        params.self_signed(&key).unwrap().der().clone()
    }

    fn name(org: &str) -> LegalName {
        LegalName::new(org, "London", "GB").unwrap()
    }

    fn context(allowed: Option<&[&str]>) -> ChannelContext {
        ChannelContext {
            role: ChannelRole::Server,
            remote_address: NetworkHostAndPort::new("127.0.0.1", 5000),
            local_address: NetworkHostAndPort::new("127.0.0.1", 10000),
            allowed_remote_legal_names: allowed.map(|orgs| orgs.iter().map(|o| name(o)).collect()),
            max_message_size: 1024,
            credentials: None,
            trace: false,
            silenced: false,
            engine_factory: FramedEngineFactory::shared(),
            completion_sink: Arc::new(Completions::default()),
        }
    }

    fn outcome(peer: &str) -> HandshakeOutcome {
        HandshakeOutcome {
            local_chain: vec![cert("Server")],
            peer_chain: vec![cert(peer)],
            alias: Some("node".into()),
        }
    }

    fn running(allowed: Option<&[&str]>) -> (ConnectionChannel, FramedEngine) {
        let mut channel = ConnectionChannel::new(context(allowed));
        channel.begin_handshake().unwrap();
        let actions = channel.handshake_completed(outcome("Client")).unwrap();

        let mut peer = FramedEngine::new(EngineParams {
            role: ChannelRole::Client,
            container_id: "peer".into(),
            credentials: None,
            max_message_size: 1024,
        });
        peer.open().unwrap();
        for action in actions {
            if let ChannelAction::Write(bytes) = action {
                peer.on_input(&bytes).unwrap();
            }
        }
        let open = peer.take_output().unwrap();
        assert!(channel.handle(ChannelEvent::Input(open)).is_empty());
        (channel, peer)
    }

    fn message(payload: &'static [u8]) -> OutboundMessage {
        OutboundMessage::new(
            payload,
            "topic",
            "O=Client, L=London, C=GB",
            NetworkHostAndPort::new("127.0.0.1", 5000),
            BTreeMap::new(),
            1024,
        )
        .unwrap()
    }

    fn emitted(actions: &[ChannelAction]) -> Vec<&ConnectionChange> {
        actions
            .iter()
            .filter_map(|a| match a {
                ChannelAction::Emit(change) => Some(change),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn allowed_peer_connects() {
        let mut channel = ConnectionChannel::new(context(Some(&["Client"])));
        channel.begin_handshake().unwrap();
        let actions = channel.handshake_completed(outcome("Client")).unwrap();

        let changes = emitted(&actions);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].connected);
        assert_eq!(changes[0].result, ConnectionResult::Connected);
        assert_eq!(changes[0].peer_legal_name, Some(name("Client")));
        assert!(actions.iter().any(|a| matches!(a, ChannelAction::Write(_))));
        assert_eq!(channel.state(), ChannelState::EngineRunning);
        assert_eq!(channel.alias(), Some("node"));
    }

    #[test]
    fn unexpected_peer_is_bad_certificate() {
        let mut channel = ConnectionChannel::new(context(Some(&["Someone Else"])));
        channel.begin_handshake().unwrap();
        let actions = channel.handshake_completed(outcome("Client")).unwrap();

        let changes = emitted(&actions);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].connected);
        assert_eq!(changes[0].result, ConnectionResult::BadCertificate);
        assert!(matches!(actions.last(), Some(ChannelAction::Close { .. })));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.close("again").is_empty());
    }

    #[test]
    fn missing_peer_certificate_is_handshake_failure() {
        let mut channel = ConnectionChannel::new(context(None));
        channel.begin_handshake().unwrap();
        let actions = channel
            .handshake_completed(HandshakeOutcome { peer_chain: vec![], ..outcome("x") })
            .unwrap();
        assert_eq!(emitted(&actions)[0].result, ConnectionResult::HandshakeFailure);
    }

    #[test]
    fn handshake_failure_emits_one_disconnect() {
        let mut channel = ConnectionChannel::new(context(None));
        channel.begin_handshake().unwrap();
        let actions = channel.handshake_failed("timeout");
        assert_eq!(emitted(&actions).len(), 1);
        assert_eq!(channel.outcome(), Some(ConnectionResult::HandshakeFailure));
        assert!(channel.handshake_failed("again").is_empty());
        assert!(channel.close("again").is_empty());
    }

    #[test]
    fn transitions_are_monotonic() {
        let mut channel = ConnectionChannel::new(context(None));
        assert!(channel.handshake_completed(outcome("Client")).is_err());
        channel.begin_handshake().unwrap();
        assert!(channel.begin_handshake().is_err());
    }

    #[test]
    fn send_and_acknowledge() {
        let (mut channel, mut peer) = running(None);
        let msg = message(b"hello");
        let status = msg.subscribe_status();

        let actions = channel.handle(ChannelEvent::Send(msg));
        let [ChannelAction::Write(bytes)] = actions.as_slice() else {
            panic!("expected a write, got {actions:?}");
        };
        assert_eq!(*status.borrow(), MessageStatus::Sent);

        let events = peer.on_input(bytes).unwrap();
        let [EngineEvent::Received(transfer)] = events.as_slice() else {
            panic!("expected a transfer, got {events:?}");
        };
        peer.settle(transfer.delivery_id, true).unwrap();
        channel.handle(ChannelEvent::Input(peer.take_output().unwrap()));

        assert_eq!(*status.borrow(), MessageStatus::Acknowledged);
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn inbound_message_is_delivered_and_completion_settles() {
        let (mut channel, mut peer) = running(None);
        peer.transfer(
            "topic",
            "O=Server, L=London, C=GB",
            &BTreeMap::new(),
            Bytes::from_static(b"ping"),
        )
        .unwrap();

        let actions = channel.handle(ChannelEvent::Input(peer.take_output().unwrap()));
        let [ChannelAction::Deliver(inbound)] = actions.as_slice() else {
            panic!("expected a delivery, got {actions:?}");
        };
        assert_eq!(inbound.payload, Bytes::from_static(b"ping"));
        assert_eq!(inbound.source_legal_name, Some(name("Client")));
        assert_eq!(inbound.source_address, NetworkHostAndPort::new("127.0.0.1", 5000));

        let actions = channel.handle(ChannelEvent::Complete { delivery_id: 0, accepted: true });
        let [ChannelAction::Write(bytes)] = actions.as_slice() else {
            panic!("expected a disposition write, got {actions:?}");
        };
        assert!(peer.on_input(bytes).unwrap().iter().any(|e| matches!(
            e,
            EngineEvent::Settled { delivery_id: 0, accepted: true }
        )));
    }

    #[test]
    fn close_rejects_pending_and_emits_once() {
        let (mut channel, _peer) = running(None);
        let msg = message(b"hello");
        let status = msg.subscribe_status();
        channel.handle(ChannelEvent::Send(msg));

        let actions = channel.close("shutdown");
        let changes = emitted(&actions);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].connected);
        assert_eq!(changes[0].result, ConnectionResult::Closed);
        assert_eq!(*status.borrow(), MessageStatus::Rejected);
        assert!(channel.close("shutdown").is_empty());

        let late = message(b"late");
        let late_status = late.subscribe_status();
        assert!(channel.handle(ChannelEvent::Send(late)).is_empty());
        assert_eq!(*late_status.borrow(), MessageStatus::Rejected);
    }

    #[test]
    fn garbage_input_closes_channel() {
        let (mut channel, _peer) = running(None);
        let actions = channel.handle(ChannelEvent::Input(Bytes::from_static(b"XXXXXXXXXXXX")));
        assert_eq!(emitted(&actions).len(), 1);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn remote_close_closes_channel() {
        let (mut channel, mut peer) = running(None);
        peer.close(Some("bye"));
        let actions = channel.handle(ChannelEvent::Input(peer.take_output().unwrap()));
        assert!(matches!(actions.last(), Some(ChannelAction::Close { reason }) if reason == "bye"));
    }
}
