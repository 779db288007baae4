//! Peerlink node.
//!
//! Runs a server or a client endpoint from PEM files until interrupted,
//! logging connection changes and inbound messages. Inbound messages are
//! acknowledged once logged.
//!
//! ```bash
//! peerlink-node server --port 10002 --cert node.pem --key node.key --trust root.pem \
//!     --allow "O=Alice Corp, L=Madrid, C=ES" --health-check-phrase ISALIVE
//!
//! peerlink-node client --target 10.0.0.1:10002 --target 10.0.0.2:10002 \
//!     --cert node.pem --key node.key --trust root.pem \
//!     --expect "O=Bob Plc, L=Rome, C=IT" --send "hello" --topic p2p.inbound
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    net::IpAddr,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use peerlink_core::{
    ConfigError, ConnectionChange, CrlSource, FileCrlSource, InboundMessage, LegalName,
    MemoryCertificateStore, NetworkHostAndPort, RevocationConfig, RevocationMode, StoreError,
    TransportConfig, TransportConfigBuilder, TrustStore, revocation::read_crls,
};
use peerlink_transport::{PeerClient, PeerServer, TransportError};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Peerlink secure peer transport node
#[derive(Parser, Debug)]
#[command(name = "peerlink-node", version, about, long_about = None)]
struct Cli {
    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections on one port
    Server(ServerArgs),
    /// Connect to the first reachable target
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct TlsArgs {
    /// PEM certificate chain, leaf first
    #[arg(long)]
    cert: PathBuf,

    /// PEM private key
    #[arg(long)]
    key: PathBuf,

    /// PEM trust anchors
    #[arg(long)]
    trust: PathBuf,

    /// Alias of the identity in the key store
    #[arg(long, default_value = "node")]
    alias: String,

    /// Secret protecting the key store entry
    #[arg(long, env = "PEERLINK_KEY_PASSWORD", default_value = "")]
    key_password: String,

    /// Revocation mode: off, soft-fail, hard-fail or external-source
    #[arg(long, default_value = "soft-fail")]
    revocation: RevocationMode,

    /// PEM CRL file; repeatable
    #[arg(long = "crl")]
    crls: Vec<PathBuf>,

    /// Largest message payload in bytes
    #[arg(long)]
    max_message_size: Option<usize>,

    /// TLS handshake timeout in seconds
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Engine username, sent by clients and checked by servers
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Engine password
    #[arg(long, env = "PEERLINK_PASSWORD", requires = "username")]
    password: Option<String>,

    /// Log every message at debug
    #[arg(long)]
    trace: bool,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long)]
    port: u16,

    /// Legal name allowed to connect; repeatable, any peer when absent
    #[arg(long = "allow")]
    allowed: Vec<LegalName>,

    /// Plaintext phrase answered by echo, for load balancer probes
    #[arg(long)]
    health_check_phrase: Option<String>,

    /// Peer IP whose connections are logged at debug; repeatable
    #[arg(long = "silence-ip")]
    silenced_ips: Vec<IpAddr>,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Server address in host:port form, tried in order; repeatable
    #[arg(long = "target", required = true)]
    targets: Vec<NetworkHostAndPort>,

    /// Legal name the server must present; repeatable, any server when absent
    #[arg(long = "expect")]
    expected: Vec<LegalName>,

    /// Payload to send once connected
    #[arg(long)]
    send: Option<String>,

    /// Topic of the sent payload
    #[arg(long, default_value = "p2p.inbound")]
    topic: String,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(Debug, Error)]
enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match cli.command {
        Command::Server(args) => run_server(args),
        Command::Client(args) => run_client(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "node failed");
            ExitCode::FAILURE
        },
    }
}

fn init_logging(default: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn transport_config(args: TlsArgs) -> Result<TransportConfigBuilder, NodeError> {
    let mut store = MemoryCertificateStore::new();
    store.insert_pem_files(args.alias, &args.cert, &args.key, args.key_password.clone())?;

    let revocation = match args.revocation {
        RevocationMode::ExternalSource => {
            let source: Arc<dyn CrlSource> = Arc::new(FileCrlSource::new(args.crls));
            RevocationConfig::new(RevocationMode::ExternalSource, Some(source))?
        },
        mode => {
            let mut crls = Vec::new();
            for path in &args.crls {
                crls.extend(read_crls(path)?);
            }
            RevocationConfig::new(mode, None)?.with_crls(crls)
        },
    };

    let mut builder = TransportConfig::builder()
        .key_store(store.into_shared())
        .trust_store(TrustStore::from_pem_file(&args.trust)?)
        .key_password(args.key_password)
        .revocation(revocation)
        .trace(args.trace);
    if let Some(size) = args.max_message_size {
        builder = builder.max_message_size(size);
    }
    if let Some(seconds) = args.handshake_timeout {
        builder = builder.handshake_timeout(Duration::from_secs(seconds));
    }
    if let (Some(username), Some(password)) = (args.username, args.password) {
        builder = builder.credentials(username, password);
    }
    Ok(builder)
}

fn allow_list(names: Vec<LegalName>) -> Option<HashSet<LegalName>> {
    if names.is_empty() { None } else { Some(names.into_iter().collect()) }
}

fn run_server(args: ServerArgs) -> Result<(), NodeError> {
    let mut builder = transport_config(args.tls)?;
    if let Some(phrase) = args.health_check_phrase {
        builder = builder.health_check_phrase(phrase);
    }
    for ip in args.silenced_ips {
        builder = builder.silence_ip(ip);
    }

    let server = PeerServer::new(args.host, args.port, builder.build()?, allow_list(args.allowed));
    let changes = server.subscribe_connection_changes();
    let inbox = server.subscribe_received();
    server.start()?;

    let result = event_loop(changes, inbox, |_| {});
    server.stop();
    result
}

fn run_client(args: ClientArgs) -> Result<(), NodeError> {
    let config = transport_config(args.tls)?.build()?;
    let client = PeerClient::new(args.targets, allow_list(args.expected), config);
    let changes = client.subscribe_connection_changes();
    let inbox = client.subscribe_received();
    client.start()?;

    let mut pending = args.send;
    let result = event_loop(changes, inbox, |change| {
        if !change.connected {
            return;
        }
        let Some(payload) = pending.take() else {
            return;
        };
        let destination = change
            .peer_legal_name
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let sent = client
            .create_message(
                payload.into_bytes(),
                args.topic.clone(),
                destination,
                change.remote_address.clone(),
                BTreeMap::new(),
            )
            .and_then(|message| client.write(message));
        if let Err(e) = sent {
            warn!(error = %e, "failed to send message");
        }
    });
    client.stop();
    result
}

/// Log events until interrupted. Runs on a private runtime so the endpoint
/// can be stopped from this thread afterwards.
fn event_loop(
    mut changes: broadcast::Receiver<ConnectionChange>,
    mut inbox: broadcast::Receiver<InboundMessage>,
    mut on_change: impl FnMut(&ConnectionChange),
) -> Result<(), NodeError> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    break;
                },
                change = changes.recv() => match change {
                    Ok(change) => {
                        let legal_name = change.peer_legal_name.as_ref().map(ToString::to_string);
                        info!(
                            remote = %change.remote_address,
                            legal_name = legal_name.as_deref(),
                            connected = change.connected,
                            result = ?change.result,
                            "connection change"
                        );
                        on_change(&change);
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "connection events dropped"),
                    Err(RecvError::Closed) => break,
                },
                message = inbox.recv() => match message {
                    Ok(message) => {
                        info!(
                            source = %message.source_address,
                            topic = %message.topic,
                            size = message.payload.len(),
                            "received message"
                        );
                        message.complete(true);
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "inbound messages dropped"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
    Ok(())
}
