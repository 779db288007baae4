//! Transport error types.

use std::io;

use peerlink_core::{MessageError, NetworkHostAndPort, TlsError};
use thiserror::Error;

/// Endpoint failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Listening socket could not be bound
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address requested
        address: NetworkHostAndPort,
        /// Underlying error
        source: io::Error,
    },

    /// No live connection to the destination
    #[error("not connected to {0}")]
    NotConnected(NetworkHostAndPort),

    /// Endpoint has not been started or was stopped
    #[error("endpoint is not running")]
    NotStarted,

    /// Message body above the configured maximum
    #[error("message of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Body size
        size: usize,
        /// Limit
        max: usize,
    },

    /// TLS configuration could not be built
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Worker threads could not be started
    #[error("failed to start reactor: {0}")]
    Runtime(io::Error),

    /// Socket failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<MessageError> for TransportError {
    fn from(error: MessageError) -> Self {
        match error {
            MessageError::PayloadTooLarge { size, max } => Self::PayloadTooLarge { size, max },
        }
    }
}
