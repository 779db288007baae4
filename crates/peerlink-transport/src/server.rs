//! Server endpoint.
//!
//! Listens on one port, runs the preamble selector and the TLS handshake on
//! every accepted socket, and keeps a table of live channels keyed by remote
//! address so messages can be sent back to connected peers.
//!
//! # Connection lifecycle
//!
//! ```text
//! accept ──> sniff preamble ──┬──> echo loop (probe, no events)
//!   │                         │
//!   │  handshake deadline     └──> replay bytes ──> ClientHello ──> SNI identity
//!   │  covers sniff + TLS                                               │
//!   └────────────────────────────────────────────────────────────> TLS handshake
//!                                                                       │
//!                                                  ConnectionChannel <──┘
//! ```
//!
//! A probe cancels the handshake deadline; it stays open until the peer
//! hangs up or the server stops.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_core::{
    Backoff, ChannelEvent, ChannelRole, ConnectionChange, EngineFactory, FramedEngineFactory,
    HandshakeOutcome, InboundMessage, LegalName, ModeSelector, NetworkHostAndPort,
    OutboundMessage, PropertyValue, SelectorDecision, TransportConfig, tls,
};
use rustls::server::{Acceptor, StoresServerSessions};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, watch},
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tokio_rustls::{LazyConfigAcceptor, server::TlsStream};
use tracing::{debug, info, warn};

use crate::{
    driver::{self, ChannelCommand, ChannelFactory, ChannelObserver, CommandSender},
    error::TransportError,
    reactor::{Reactor, SERVER_WORKER_THREADS},
    stream::PrefixedStream,
};

/// Capacity of the event broadcast channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Time `stop` waits for connections to wind down.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const PROBE_BUFFER_SIZE: usize = 1024;

/// First pause after a failed accept, doubled per consecutive failure.
const ACCEPT_RETRY_MIN: Duration = Duration::from_millis(10);

/// Longest pause between failed accepts.
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

/// TLS stream of an accepted connection.
type ServerStream = TlsStream<PrefixedStream<TcpStream>>;

/// Accepting endpoint.
pub struct PeerServer {
    address: NetworkHostAndPort,
    shared: Arc<ServerShared>,
    state: Mutex<ServerState>,
}

struct ServerShared {
    channels: ChannelFactory,
    session_cache: Arc<dyn StoresServerSessions>,
    live: Mutex<HashMap<NetworkHostAndPort, CommandSender>>,
    changes: broadcast::Sender<ConnectionChange>,
    received: broadcast::Sender<InboundMessage>,
    listening: AtomicBool,
}

#[derive(Default)]
struct ServerState {
    reactor: Option<Reactor>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

enum Sniffed {
    Probe(TcpStream, Bytes),
    Tls(PrefixedStream<TcpStream>),
}

enum Handshake {
    Probe(TcpStream, Bytes),
    Tls(Box<ServerStream>, HandshakeOutcome),
}

impl PeerServer {
    /// Create a server for `host:port`.
    ///
    /// `allowed_remote_legal_names` restricts which clients may connect;
    /// `None` accepts any authenticated client.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        config: TransportConfig,
        allowed_remote_legal_names: Option<HashSet<LegalName>>,
    ) -> Self {
        Self::with_engine_factory(
            host,
            port,
            config,
            allowed_remote_legal_names,
            FramedEngineFactory::shared(),
        )
    }

    /// Create a server whose channels use `engine_factory`.
    pub fn with_engine_factory(
        host: impl Into<String>,
        port: u16,
        config: TransportConfig,
        allowed_remote_legal_names: Option<HashSet<LegalName>>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let (changes, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (received, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            address: NetworkHostAndPort::new(host, port),
            shared: Arc::new(ServerShared {
                channels: ChannelFactory {
                    config: Arc::new(config),
                    allowed_remote_legal_names,
                    engine_factory,
                },
                session_cache: tls::server_session_cache(),
                live: Mutex::new(HashMap::new()),
                changes,
                received,
                listening: AtomicBool::new(false),
            }),
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Bind and start accepting. The bind happens before this returns.
    ///
    /// Starting a running server does nothing.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.reactor.is_some() {
            return Ok(());
        }

        let bind_error =
            |source| TransportError::Bind { address: self.address.clone(), source };
        let listener = std::net::TcpListener::bind((self.address.host(), self.address.port()))
            .map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let reactor = Reactor::owned("peerlink-server", SERVER_WORKER_THREADS)?;
        let handle = reactor.handle();
        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(listener).map_err(bind_error)?
        };

        let (shutdown, signal) = watch::channel(false);
        self.shared.listening.store(true, Ordering::SeqCst);
        let accept_task = handle.spawn(accept_loop(Arc::clone(&self.shared), listener, signal));
        info!(address = %self.address, %local_addr, "server listening");

        *state = ServerState {
            reactor: Some(reactor),
            shutdown: Some(shutdown),
            accept_task: Some(accept_task),
            local_addr: Some(local_addr),
        };
        Ok(())
    }

    /// Stop accepting, close every connection and release the port.
    ///
    /// Blocks until connections have closed. Must not be called from inside
    /// an async context. Stopping a stopped server does nothing.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        let Some(reactor) = state.reactor.take() else {
            return;
        };
        info!(address = %self.address, "stopping server");

        if let Some(shutdown) = state.shutdown.take() {
            shutdown.send_replace(true);
        }
        if let Some(task) = state.accept_task.take()
            && !reactor.join_within(task, STOP_TIMEOUT)
        {
            warn!(address = %self.address, "connections did not close in time");
        }
        state.local_addr = None;
        self.shared.listening.store(false, Ordering::SeqCst);
        self.shared.live.lock().clear();
        reactor.shutdown(STOP_TIMEOUT);
    }

    /// Whether the listening socket is bound.
    pub fn listening(&self) -> bool {
        self.shared.listening.load(Ordering::SeqCst)
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local_addr
    }

    /// Configured listen address.
    pub fn address(&self) -> &NetworkHostAndPort {
        &self.address
    }

    /// Remote addresses of live connections.
    pub fn connected_peers(&self) -> Vec<NetworkHostAndPort> {
        self.shared.live.lock().keys().cloned().collect()
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

    /// Queue `message` on the live connection to its destination.
    pub fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let destination = message.destination().clone();
        let live = self.shared.live.lock();
        let Some(commands) = live.get(&destination) else {
            return Err(TransportError::NotConnected(destination));
        };
        commands
            .send(ChannelCommand::Dispatch(ChannelEvent::Send(message)))
            .map_err(|_| TransportError::NotConnected(destination))
    }

    /// Close the live connection to `remote`. Returns whether one existed.
    pub fn drop_connection(&self, remote: &NetworkHostAndPort) -> bool {
        let live = self.shared.live.lock();
        match live.get(remote) {
            Some(commands) => {
                debug!(%remote, "dropping connection");
                commands.send(ChannelCommand::Close("dropped by local request".into())).is_ok()
            },
            None => false,
        }
    }

    /// Receive inbound messages from every connection.
    pub fn subscribe_received(&self) -> broadcast::Receiver<InboundMessage> {
        self.shared.received.subscribe()
    }

    /// Receive connect and disconnect notifications.
    pub fn subscribe_connection_changes(&self) -> broadcast::Receiver<ConnectionChange> {
        self.shared.changes.subscribe()
    }
}

impl Drop for PeerServer {
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

impl ChannelObserver for ServerShared {
    fn on_change(&self, change: &ConnectionChange, commands: &CommandSender) {
        let mut live = self.live.lock();
        if change.connected {
            if let Some(previous) = live.insert(change.remote_address.clone(), commands.clone()) {
                let _ = previous.send(ChannelCommand::Close("replaced by new connection".into()));
            }
        } else if live.get(&change.remote_address).is_some_and(|c| c.same_channel(commands)) {
            live.remove(&change.remote_address);
        }
        drop(live);
        let _ = self.changes.send(change.clone());
    }

    fn on_message(&self, message: InboundMessage) {
        if let Err(broadcast::error::SendError(message)) = self.received.send(message) {
            debug!(source = %message.source_address, "no subscribers, rejecting inbound message");
            message.complete(false);
        }
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    let mut retry = Backoff::new(ACCEPT_RETRY_MIN, ACCEPT_RETRY_MAX);
    let signal = shutdown.clone();
    loop {
        tokio::select! {
            () = driver::stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, remote)) => {
                    retry.reset();
                    connections.spawn(serve(Arc::clone(&shared), socket, remote, signal.clone()));
                },
                Err(e) => {
                    warn!(error = %e, delay = ?retry.current(), "accept failed");
                    if !pause_after_accept_error(&mut retry, &mut shutdown).await {
                        break;
                    }
                },
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {},
        }
    }

    drop(listener);
    shared.listening.store(false, Ordering::SeqCst);
    while connections.join_next().await.is_some() {}
}

/// Sleep out the accept backoff. Returns false if the server stopped first.
async fn pause_after_accept_error(
    retry: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        () = tokio::time::sleep(retry.next_delay()) => true,
        () = driver::stopped(shutdown) => false,
    }
}

async fn serve(
    shared: Arc<ServerShared>,
    socket: TcpStream,
    remote: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = Arc::clone(&shared.channels.config);
    let silenced = config.is_silenced(remote.ip());
    let remote_address = NetworkHostAndPort::from(remote);
    if silenced {
        debug!(remote = %remote_address, "accepted connection");
    } else {
        info!(remote = %remote_address, "accepted connection");
    }
    if let Err(e) = socket.set_nodelay(true) {
        debug!(remote = %remote_address, error = %e, "failed to set TCP_NODELAY");
    }
    let local_address = match socket.local_addr() {
        Ok(local) => NetworkHostAndPort::from(local),
        Err(e) => {
            warn!(remote = %remote_address, error = %e, "socket lost before handshake");
            return;
        },
    };

    let (mut channel, sender, receiver) = shared.channels.create(
        ChannelRole::Server,
        remote_address.clone(),
        local_address,
        silenced,
    );
    if let Err(e) = channel.begin_handshake() {
        warn!(remote = %remote_address, error = %e, "channel refused handshake");
        return;
    }

    let deadline = Instant::now() + config.handshake_timeout;
    let handshake = tokio::select! {
        result = tokio::time::timeout_at(deadline, negotiate(&shared, socket)) => match result {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                let actions = channel.handshake_failed(&e.to_string());
                driver::emit_only(actions, shared.as_ref(), &sender);
                return;
            },
            Err(_) => {
                let actions = channel.handshake_failed("handshake timed out");
                driver::emit_only(actions, shared.as_ref(), &sender);
                return;
            },
        },
        () = driver::stopped(&mut shutdown) => {
            let actions = channel.handshake_failed("server stopping");
            driver::emit_only(actions, shared.as_ref(), &sender);
            return;
        },
    };

    match handshake {
        Handshake::Probe(socket, first) => {
            debug!(remote = %remote_address, "liveness probe");
            echo(socket, first, shutdown).await;
        },
        Handshake::Tls(stream, outcome) => {
            let actions = match channel.handshake_completed(outcome) {
                Ok(actions) => actions,
                Err(e) => channel.handshake_failed(&e.to_string()),
            };
            let observer = shared.as_ref();
            driver::run_channel(*stream, channel, actions, receiver, sender, observer, shutdown)
                .await;
        },
    }
}

async fn negotiate(shared: &ServerShared, socket: TcpStream) -> Result<Handshake, TransportError> {
    let config = &shared.channels.config;
    let stream = match &config.health_check_phrase {
        Some(phrase) => match sniff(socket, phrase).await? {
            Sniffed::Probe(socket, first) => return Ok(Handshake::Probe(socket, first)),
            Sniffed::Tls(stream) => stream,
        },
        None => PrefixedStream::new(Bytes::new(), socket),
    };

    let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
    let sni = start.client_hello().server_name().map(str::to_owned);
    let session = tls::build_server_session(config, sni.as_deref(), &shared.session_cache)?;
    let stream = start.into_stream(Arc::clone(&session.config)).await?;

    let (_, connection) = stream.get_ref();
    let outcome = driver::handshake_outcome(session.identity, connection.peer_certificates());
    Ok(Handshake::Tls(Box::new(stream), outcome))
}

async fn sniff(mut socket: TcpStream, phrase: &str) -> Result<Sniffed, TransportError> {
    let mut selector = ModeSelector::new(Bytes::copy_from_slice(phrase.as_bytes()));
    let mut buf = [0u8; PROBE_BUFFER_SIZE];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        match selector.feed(&buf[..n]) {
            SelectorDecision::NeedMore => {},
            SelectorDecision::Echo(first) => return Ok(Sniffed::Probe(socket, first)),
            SelectorDecision::Normal(buffered) => {
                return Ok(Sniffed::Tls(PrefixedStream::new(buffered, socket)));
            },
        }
    }
}

async fn echo(mut socket: TcpStream, first: Bytes, mut shutdown: watch::Receiver<bool>) {
    if socket.write_all(&first).await.is_err() {
        return;
    }
    let mut buf = [0u8; PROBE_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = socket.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                },
            },
            () = driver::stopped(&mut shutdown) => break,
        }
    }
    let _ = socket.shutdown().await;
}
