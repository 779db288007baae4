//! Tokio endpoints for the Peerlink secure peer transport.
//!
//! [`PeerServer`] accepts mutually authenticated TLS connections on one port;
//! [`PeerClient`] keeps one connection open to the first reachable server of
//! an ordered list. Both publish connection changes and inbound messages on
//! broadcast channels and take outbound messages through a non-blocking
//! `send`/`write`.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  ┌────────────┐
//! │ PeerServer │  │ PeerClient │   endpoint: lifecycle, live table, failover
//! └─────┬──────┘  └─────┬──────┘
//!       └──────┬────────┘
//!              ↓
//!       ┌─────────────┐
//!       │ driver      │            one task per connection, executes
//!       └──────┬──────┘            ChannelActions
//!              ↓
//!   peerlink_core::ConnectionChannel
//! ```
//!
//! Endpoints run on their own worker threads ([`Reactor`]) so `start` and
//! `stop` are plain blocking calls. `stop` must not be called from inside an
//! async context.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod driver;
pub mod error;
pub mod reactor;
pub mod server;
pub mod stream;

pub use client::PeerClient;
pub use error::TransportError;
pub use reactor::Reactor;
pub use server::PeerServer;
