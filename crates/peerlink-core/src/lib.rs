//! Core logic for the Peerlink secure peer transport.
//!
//! Everything in this crate is I/O free. Identity selection, TLS
//! configuration, revocation policy, preamble sniffing, the per-connection
//! channel and the client failover ring are all plain values or state
//! machines. The `peerlink-transport` crate drives them from tokio tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────┐   ┌────────────────────┐
//! │ CertificateStore │──>│ identity     │──>│ tls (session       │
//! └──────────────────┘   │ selection    │   │ factory)           │
//!                        └──────────────┘   └─────────┬──────────┘
//! ┌──────────────────┐                                │
//! │ revocation       │────────────────────────────────┘
//! └──────────────────┘
//!
//! bytes ──> ModeSelector ──> TLS ──> ConnectionChannel ──> ProtocolEngine
//! ```
//!
//! State machines follow the action pattern: methods consume an event and
//! return a list of actions (`ChannelAction`) for the driver to execute.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod failover;
pub mod identity;
pub mod legal_name;
pub mod message;
pub mod preamble;
pub mod revocation;
pub mod store;
pub mod tls;

pub use address::NetworkHostAndPort;
pub use channel::{
    ChannelAction, ChannelContext, ChannelEvent, ChannelRole, ChannelState, ConnectionChange,
    ConnectionChannel, ConnectionResult, HandshakeOutcome,
};
pub use config::{Credentials, TlsVersion, TransportConfig, TransportConfigBuilder};
pub use engine::{
    EngineEvent, EngineFactory, EngineParams, FramedEngine, FramedEngineFactory, ProtocolEngine,
};
pub use error::{
    AddressError, ChannelError, ConfigError, EngineError, LegalNameError, MessageError, StoreError,
    TlsError,
};
pub use failover::{AttemptResult, Backoff, Failover, TargetRing};
pub use identity::{IdentitySelection, SelectedIdentity};
pub use legal_name::LegalName;
pub use message::{
    CompletionSink, CompletionToken, InboundMessage, MessageStatus, OutboundMessage, PropertyValue,
};
pub use preamble::{ModeSelector, SelectorDecision, SelectorState};
pub use revocation::{CrlSource, FileCrlSource, RevocationCheck, RevocationConfig, RevocationMode};
pub use store::{CertificateStore, MemoryCertificateStore, TrustStore};
pub use tls::{ClientSession, ServerSession};
