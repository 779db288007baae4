//! Channel driver.
//!
//! Runs one established [`ConnectionChannel`] over an encrypted stream. The
//! channel decides, the driver executes: every [`ChannelAction`] is carried
//! out in order, and the loop ends once the channel has closed.
//!
//! # Architecture
//!
//! ```text
//!  stream reads ──┐
//!  commands ──────┼──> select! ──> ConnectionChannel ──> Vec<ChannelAction>
//!  shutdown ──────┘                                            │
//!        ┌───────────────┬──────────────────┬─────────────────┘
//!        ↓               ↓                  ↓
//!   stream write   observer.on_message  observer.on_change
//! ```
//!
//! Commands reach a channel through an unbounded sender held by the owning
//! endpoint. Completion reports from inbound messages travel the same way,
//! so only the driver task ever touches the channel.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use peerlink_core::{
    ChannelAction, ChannelContext, ChannelEvent, ChannelRole, CompletionSink, ConnectionChange,
    ConnectionChannel, ConnectionResult, EngineFactory, HandshakeOutcome, IdentitySelection,
    InboundMessage, LegalName, NetworkHostAndPort, TransportConfig,
};
use rustls::pki_types::CertificateDer;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
};
use tracing::debug;

/// Read buffer per connection.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Time allowed for the TLS close to be written.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Request for a running channel.
#[derive(Debug)]
pub enum ChannelCommand {
    /// Feed an event to the channel
    Dispatch(ChannelEvent),
    /// Close the channel
    Close(String),
}

/// Sender side of a channel's command queue.
pub type CommandSender = mpsc::UnboundedSender<ChannelCommand>;

/// Routes inbound completion reports back to the owning channel.
#[derive(Debug, Clone)]
pub struct CommandSink(CommandSender);

impl CompletionSink for CommandSink {
    fn complete(&self, delivery_id: u64, accepted: bool) {
        // A closed queue means the channel is gone and the delivery is moot.
        let event = ChannelEvent::Complete { delivery_id, accepted };
        let _ = self.0.send(ChannelCommand::Dispatch(event));
    }
}

/// Endpoint side of a running channel.
pub trait ChannelObserver: Send + Sync {
    /// A connect or disconnect was emitted. `commands` addresses the channel
    /// that emitted it.
    fn on_change(&self, change: &ConnectionChange, commands: &CommandSender);

    /// An inbound message arrived.
    fn on_message(&self, message: InboundMessage);
}

/// Everything needed to build channels for one endpoint.
#[derive(Clone)]
pub struct ChannelFactory {
    /// Endpoint configuration
    pub config: Arc<TransportConfig>,
    /// Accepted peer names
    pub allowed_remote_legal_names: Option<HashSet<LegalName>>,
    /// Protocol engine used by every channel
    pub engine_factory: Arc<dyn EngineFactory>,
}

impl ChannelFactory {
    /// New channel plus its command queue.
    pub fn create(
        &self,
        role: ChannelRole,
        remote: NetworkHostAndPort,
        local: NetworkHostAndPort,
        silenced: bool,
    ) -> (ConnectionChannel, CommandSender, mpsc::UnboundedReceiver<ChannelCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let context = ChannelContext {
            role,
            remote_address: remote,
            local_address: local,
            allowed_remote_legal_names: self.allowed_remote_legal_names.clone(),
            max_message_size: self.config.max_message_size,
            credentials: self.config.credentials.clone(),
            trace: self.config.trace,
            silenced,
            engine_factory: Arc::clone(&self.engine_factory),
            completion_sink: Arc::new(CommandSink(sender.clone())),
        };
        (ConnectionChannel::new(context), sender, receiver)
    }
}

/// Publish the events among `actions` for a channel that never got a stream.
pub fn emit_only(
    actions: Vec<ChannelAction>,
    observer: &dyn ChannelObserver,
    commands: &CommandSender,
) {
    for action in actions {
        match action {
            ChannelAction::Emit(change) => observer.on_change(&change, commands),
            ChannelAction::Deliver(message) => observer.on_message(message),
            ChannelAction::Write(_) | ChannelAction::Close { .. } => {},
        }
    }
}

/// Resolve once `shutdown` reads true. A closed signal counts as stopping.
///
/// Holds no borrow of the signal value, so it can sit in a `select!` next to
/// branches that await.
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

/// Handshake facts from the selected local identity and the peer chain.
pub fn handshake_outcome(
    identity: Option<IdentitySelection>,
    peer_chain: Option<&[CertificateDer<'static>]>,
) -> HandshakeOutcome {
    HandshakeOutcome {
        local_chain: identity.as_ref().map(|i| i.certified_key.cert.clone()).unwrap_or_default(),
        peer_chain: peer_chain.map(<[_]>::to_vec).unwrap_or_default(),
        alias: identity.map(|i| i.alias),
    }
}

/// Drive `channel` over `stream` until it closes.
///
/// `initial` holds the actions returned by the handshake. Returns the result
/// of the last connection change the channel emitted.
pub async fn run_channel<S>(
    mut stream: S,
    mut channel: ConnectionChannel,
    initial: Vec<ChannelAction>,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    sender: CommandSender,
    observer: &dyn ChannelObserver,
    mut shutdown: watch::Receiver<bool>,
) -> Option<ConnectionResult>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut open = execute(&mut stream, &mut channel, initial, observer, &sender).await;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    while open {
        let actions = tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => channel.close("connection closed by peer"),
                Ok(n) => channel.handle(ChannelEvent::Input(Bytes::copy_from_slice(&buf[..n]))),
                Err(e) => channel.close(&format!("read failed: {e}")),
            },
            command = commands.recv() => match command {
                Some(ChannelCommand::Dispatch(event)) => channel.handle(event),
                Some(ChannelCommand::Close(reason)) => channel.close(&reason),
                None => channel.close("endpoint dropped"),
            },
            () = stopped(&mut shutdown) => channel.close("endpoint stopping"),
        };
        open = execute(&mut stream, &mut channel, actions, observer, &sender).await;
    }

    // Reject anything queued after the close.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let ChannelCommand::Dispatch(event) = command {
            channel.handle(event);
        }
    }

    if tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await.is_err() {
        debug!(remote = %channel.context().remote_address, "close notify timed out");
    }
    channel.outcome()
}

/// Execute `actions` in order. Returns whether the channel is still open.
async fn execute<S>(
    stream: &mut S,
    channel: &mut ConnectionChannel,
    actions: Vec<ChannelAction>,
    observer: &dyn ChannelObserver,
    sender: &CommandSender,
) -> bool
where
    S: AsyncWrite + Unpin + Send,
{
    let mut queue: VecDeque<ChannelAction> = actions.into();
    let mut open = true;
    while let Some(action) = queue.pop_front() {
        match action {
            ChannelAction::Write(bytes) => {
                if let Err(e) = write(stream, &bytes).await {
                    queue.extend(channel.close(&format!("write failed: {e}")));
                }
            },
            ChannelAction::Deliver(message) => observer.on_message(message),
            ChannelAction::Emit(change) => observer.on_change(&change, sender),
            ChannelAction::Close { reason } => {
                debug!(remote = %channel.context().remote_address, %reason, "closing socket");
                open = false;
            },
        }
    }
    open
}

async fn write<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}
