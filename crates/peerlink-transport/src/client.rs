//! Client endpoint.
//!
//! Keeps one connection open to the first reachable target of an ordered
//! list. A supervisor task owns the [`Failover`] policy: after every ended
//! attempt it picks the next target, waits out the backoff, and tries again
//! until the client is stopped or every target has been blacklisted for
//! presenting an unexpected certificate.
//!
//! ```text
//!            ┌──────────────────────── backoff sleep <──────────────┐
//!            ↓                                                      │
//! current target ──> TCP connect ──> TLS handshake ──> run channel ─┤
//!                        │ failed          │ failed / bad cert      │
//!                        └─────────────────┴────────────────────────┘
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_core::{
    AttemptResult, Backoff, ChannelEvent, ChannelRole, ConnectionChange, ConnectionResult,
    EngineFactory, Failover, FramedEngineFactory, InboundMessage, LegalName,
    NetworkHostAndPort, OutboundMessage, PropertyValue, TransportConfig, tls,
};
use rustls::client::ClientSessionStore;
use tokio::{
    net::TcpStream,
    runtime::Handle,
    sync::{broadcast, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::{
    driver::{self, ChannelCommand, ChannelFactory, ChannelObserver, CommandSender},
    error::TransportError,
    reactor::{CLIENT_WORKER_THREADS, Reactor},
    server::{EVENT_CHANNEL_CAPACITY, STOP_TIMEOUT},
};

/// Connecting endpoint with failover.
pub struct PeerClient {
    shared: Arc<ClientShared>,
    shared_runtime: Option<Handle>,
    state: Mutex<ClientState>,
}

struct ClientShared {
    targets: Vec<NetworkHostAndPort>,
    channels: ChannelFactory,
    session_store: Arc<dyn ClientSessionStore>,
    failover: Mutex<Failover>,
    active: Mutex<Option<CommandSender>>,
    changes: broadcast::Sender<ConnectionChange>,
    received: broadcast::Sender<InboundMessage>,
}

#[derive(Default)]
struct ClientState {
    reactor: Option<Reactor>,
    shutdown: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
}

impl PeerClient {
    /// Create a client for `targets`, tried in order.
    ///
    /// `allowed_remote_legal_names` lists the servers this client accepts;
    /// `None` accepts any authenticated server. The client gets its own
    /// worker threads when started.
    pub fn new(
        targets: Vec<NetworkHostAndPort>,
        allowed_remote_legal_names: Option<HashSet<LegalName>>,
        config: TransportConfig,
    ) -> Self {
        Self::build(
            targets,
            allowed_remote_legal_names,
            config,
            None,
            FramedEngineFactory::shared(),
        )
    }

    /// Create a client that runs on `runtime` instead of its own threads.
    ///
    /// Stopping the client leaves `runtime` running.
    pub fn with_shared_reactor(
        targets: Vec<NetworkHostAndPort>,
        allowed_remote_legal_names: Option<HashSet<LegalName>>,
        config: TransportConfig,
        runtime: Handle,
    ) -> Self {
        Self::build(
            targets,
            allowed_remote_legal_names,
            config,
            Some(runtime),
            FramedEngineFactory::shared(),
        )
    }

    /// Create a client whose channels use `engine_factory`.
    ///
    /// `runtime`, when given, is shared as in
    /// [`with_shared_reactor`](Self::with_shared_reactor).
    pub fn with_engine_factory(
        targets: Vec<NetworkHostAndPort>,
        allowed_remote_legal_names: Option<HashSet<LegalName>>,
        config: TransportConfig,
        runtime: Option<Handle>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self::build(targets, allowed_remote_legal_names, config, runtime, engine_factory)
    }

    fn build(
        targets: Vec<NetworkHostAndPort>,
        allowed_remote_legal_names: Option<HashSet<LegalName>>,
        config: TransportConfig,
        shared_runtime: Option<Handle>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let (changes, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (received, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(ClientShared {
                failover: Mutex::new(Failover::new(targets.clone(), Backoff::default())),
                targets,
                channels: ChannelFactory {
                    config: Arc::new(config),
                    allowed_remote_legal_names,
                    engine_factory,
                },
                session_store: tls::client_session_cache(),
                active: Mutex::new(None),
                changes,
                received,
            }),
            shared_runtime,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Replace the retry backoff. Takes effect from the next attempt.
    #[must_use]
    pub fn with_backoff(self, backoff: Backoff) -> Self {
        *self.shared.failover.lock() = Failover::new(self.shared.targets.clone(), backoff);
        self
    }

    /// Start connecting in the background.
    ///
    /// Starting a running client does nothing.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.reactor.is_some() {
            return Ok(());
        }

        let reactor = match &self.shared_runtime {
            Some(handle) => Reactor::Shared(handle.clone()),
            None => Reactor::owned("peerlink-client", CLIENT_WORKER_THREADS)?,
        };
        let (shutdown, signal) = watch::channel(false);
        info!(targets = ?self.shared.targets, "client starting");
        let supervisor = reactor.handle().spawn(supervise(Arc::clone(&self.shared), signal));

        *state = ClientState {
            reactor: Some(reactor),
            shutdown: Some(shutdown),
            supervisor: Some(supervisor),
        };
        Ok(())
    }

    /// Close the connection and cancel any scheduled reconnect.
    ///
    /// Blocks until the connection has closed. Must not be called from
    /// inside an async context. Stopping a stopped client does nothing.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        let Some(reactor) = state.reactor.take() else {
            return;
        };
        info!("client stopping");

        if let Some(shutdown) = state.shutdown.take() {
            shutdown.send_replace(true);
        }
        if let Some(task) = state.supervisor.take()
            && !reactor.join_within(task, STOP_TIMEOUT)
        {
            warn!("connection did not close in time");
        }
        *self.shared.active.lock() = None;
        reactor.shutdown(STOP_TIMEOUT);
    }

    /// Whether a connection is established.
    pub fn connected(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    /// Target currently in use; `None` once every target is blacklisted.
    pub fn current_target(&self) -> Option<NetworkHostAndPort> {
        self.shared.failover.lock().current().cloned()
    }

    /// Targets that presented an unexpected certificate.
    pub fn bad_certificate_targets(&self) -> HashSet<NetworkHostAndPort> {
        self.shared.failover.lock().bad_certificates().clone()
    }

    /// Build a message bounded by the configured maximum size.
    pub fn create_message(
        &self,
        payload: impl Into<Bytes>,
        topic: impl Into<String>,
        destination_legal_name: impl Into<String>,
        destination: NetworkHostAndPort,
        properties: BTreeMap<String, PropertyValue>,
    ) -> Result<OutboundMessage, TransportError> {
        Ok(OutboundMessage::new(
            payload,
            topic,
            destination_legal_name,
            destination,
            properties,
            self.shared.channels.config.max_message_size,
        )?)
    }

    /// Queue `message` on the current connection.
    pub fn write(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let active = self.shared.active.lock();
        let Some(commands) = active.as_ref() else {
            return Err(TransportError::NotConnected(message.destination().clone()));
        };
        let destination = message.destination().clone();
        commands
            .send(ChannelCommand::Dispatch(ChannelEvent::Send(message)))
            .map_err(|_| TransportError::NotConnected(destination))
    }

    /// Receive inbound messages.
    pub fn subscribe_received(&self) -> broadcast::Receiver<InboundMessage> {
        self.shared.received.subscribe()
    }

    /// Receive connect and disconnect notifications.
    pub fn subscribe_connection_changes(&self) -> broadcast::Receiver<ConnectionChange> {
        self.shared.changes.subscribe()
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(shutdown) = state.shutdown.take() {
            shutdown.send_replace(true);
        }
        if let Some(reactor) = state.reactor.take() {
            reactor.shutdown_background();
        }
    }
}

impl ChannelObserver for ClientShared {
    fn on_change(&self, change: &ConnectionChange, commands: &CommandSender) {
        {
            let mut active = self.active.lock();
            if change.connected {
                self.failover.lock().on_connected();
                *active = Some(commands.clone());
            } else if active.as_ref().is_some_and(|c| c.same_channel(commands)) {
                *active = None;
            }
        }
        let _ = self.changes.send(change.clone());
    }

    fn on_message(&self, message: InboundMessage) {
        if let Err(broadcast::error::SendError(message)) = self.received.send(message) {
            debug!(source = %message.source_address, "no subscribers, rejecting inbound message");
            message.complete(false);
        }
    }
}

async fn supervise(shared: Arc<ClientShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let Some(target) = shared.failover.lock().current().cloned() else {
            warn!("no usable target left, client giving up");
            return;
        };

        let result = attempt(&shared, &target, shutdown.clone()).await;
        if *shutdown.borrow() {
            return;
        }

        let next = shared.failover.lock().on_attempt_ended(result);
        let Some((next, delay)) = next else {
            let bad = shared.failover.lock().bad_certificates().clone();
            warn!(?bad, "every target presented an unexpected certificate");
            return;
        };
        info!(%next, ?delay, ?result, "scheduling reconnect");

        tokio::select! {
            () = tokio::time::sleep(delay) => {},
            () = driver::stopped(&mut shutdown) => return,
        }
    }
}

async fn attempt(
    shared: &ClientShared,
    target: &NetworkHostAndPort,
    mut shutdown: watch::Receiver<bool>,
) -> AttemptResult {
    let config = &shared.channels.config;
    let deadline = Instant::now() + config.handshake_timeout;
    debug!(%target, "connecting");

    let connect = TcpStream::connect((target.host(), target.port()));
    let socket = tokio::select! {
        result = tokio::time::timeout_at(deadline, connect) => match result {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                info!(%target, error = %e, "connect failed");
                return AttemptResult::Failed;
            },
            Err(_) => {
                info!(%target, "connect timed out");
                return AttemptResult::Failed;
            },
        },
        () = driver::stopped(&mut shutdown) => return AttemptResult::Failed,
    };
    if let Err(e) = socket.set_nodelay(true) {
        debug!(%target, error = %e, "failed to set TCP_NODELAY");
    }
    let (Ok(local), Ok(remote)) = (socket.local_addr(), socket.peer_addr()) else {
        return AttemptResult::Failed;
    };
    let silenced = config.is_silenced(remote.ip());

    let (mut channel, sender, receiver) = shared.channels.create(
        ChannelRole::Client,
        target.clone(),
        NetworkHostAndPort::from(local),
        silenced,
    );
    if let Err(e) = channel.begin_handshake() {
        warn!(%target, error = %e, "channel refused handshake");
        return AttemptResult::Failed;
    }

    let session = match tls::build_client_session(
        target,
        shared.channels.allowed_remote_legal_names.as_ref(),
        config,
        &shared.session_store,
    ) {
        Ok(session) => session,
        Err(e) => {
            let actions = channel.handshake_failed(&e.to_string());
            driver::emit_only(actions, shared, &sender);
            return AttemptResult::Failed;
        },
    };

    let connector = TlsConnector::from(Arc::clone(&session.config));
    let handshake = connector.connect(session.server_name.clone(), socket);
    let stream = tokio::select! {
        result = tokio::time::timeout_at(deadline, handshake) => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                driver::emit_only(channel.handshake_failed(&e.to_string()), shared, &sender);
                return AttemptResult::Failed;
            },
            Err(_) => {
                driver::emit_only(channel.handshake_failed("handshake timed out"), shared, &sender);
                return AttemptResult::Failed;
            },
        },
        () = driver::stopped(&mut shutdown) => {
            driver::emit_only(channel.handshake_failed("client stopping"), shared, &sender);
            return AttemptResult::Failed;
        },
    };

    let (_, connection) = stream.get_ref();
    let outcome = driver::handshake_outcome(session.identity, connection.peer_certificates());
    let actions = match channel.handshake_completed(outcome) {
        Ok(actions) => actions,
        Err(e) => channel.handshake_failed(&e.to_string()),
    };

    match driver::run_channel(stream, channel, actions, receiver, sender, shared, shutdown).await {
        Some(ConnectionResult::BadCertificate) => AttemptResult::BadCertificate,
        Some(ConnectionResult::Closed) => AttemptResult::Disconnected,
        Some(ConnectionResult::Connected | ConnectionResult::HandshakeFailure) | None => {
            AttemptResult::Failed
        },
    }
}

#[cfg(test)]
mod tests {
    use peerlink_harness::{TestCa, alice, bob, config_builder};

    use super::*;

    fn unreachable_client(max_message_size: usize) -> PeerClient {
        let ca = TestCa::new("Client Root").unwrap();
        let alice = ca.issue(&alice(), 1).unwrap();
        let config = config_builder(&ca, &[&alice])
            .unwrap()
            .max_message_size(max_message_size)
            .build()
            .unwrap();
        PeerClient::new(vec![target()], None, config)
    }

    fn target() -> NetworkHostAndPort {
        NetworkHostAndPort::new("127.0.0.1", 1)
    }

    #[test]
    fn write_without_connection_fails() {
        let client = unreachable_client(1024);
        let message = client
            .create_message(&b"hi"[..], "topic", bob().to_string(), target(), BTreeMap::new())
            .unwrap();

        assert!(matches!(client.write(message), Err(TransportError::NotConnected(_))));
        assert!(!client.connected());
        assert_eq!(client.current_target(), Some(target()));
        assert!(client.bad_certificate_targets().is_empty());
    }

    #[test]
    fn oversized_message_is_refused() {
        let client = unreachable_client(4);
        let result = client.create_message(
            &b"too long"[..],
            "topic",
            bob().to_string(),
            target(),
            BTreeMap::new(),
        );
        assert!(matches!(result, Err(TransportError::PayloadTooLarge { size: 8, max: 4 })));
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let client = unreachable_client(1024);
        client.stop();
        client.stop();
        assert!(!client.connected());
    }
}
