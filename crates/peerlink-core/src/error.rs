//! Error types for the core crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::channel::ChannelState;

/// Malformed `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// No port separator found
    #[error("missing port in address {0:?}")]
    MissingPort(String),

    /// Host part was empty
    #[error("missing host in address {0:?}")]
    MissingHost(String),

    /// Port did not parse as a 16-bit integer
    #[error("invalid port in address {0:?}")]
    InvalidPort(String),
}

/// Malformed or unacceptable legal name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LegalNameError {
    /// A mandatory attribute (O, L or C) is absent
    #[error("legal name is missing mandatory attribute {0}")]
    MissingAttribute(&'static str),

    /// Attribute key outside CN, OU, O, L, ST, C
    #[error("unsupported legal name attribute {0:?}")]
    UnsupportedAttribute(String),

    /// The same attribute appeared twice
    #[error("duplicate legal name attribute {0}")]
    DuplicateAttribute(&'static str),

    /// Attribute value violates the character or length rules
    #[error("invalid value for {attribute}: {reason}")]
    InvalidValue {
        /// Attribute key
        attribute: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// `K=V` pair without an `=`
    #[error("malformed legal name component {0:?}")]
    MalformedComponent(String),

    /// Certificate could not be parsed as X.509
    #[error("unparsable certificate: {0}")]
    Certificate(String),
}

/// Certificate store lookup failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Alias not present in the store
    #[error("unknown alias {0:?}")]
    UnknownAlias(String),

    /// Wrong unlock secret for the alias' private key
    #[error("private key for alias {0:?} is locked")]
    KeyLocked(String),

    /// Alias has no certificates
    #[error("empty certificate chain for alias {0:?}")]
    EmptyChain(String),

    /// PEM file could not be read
    #[error("failed to read {path}: {source}")]
    Pem {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// PEM file contained no private key
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// Trust anchor rejected by rustls
    #[error("invalid trust anchor: {0}")]
    InvalidAnchor(String),

    /// Alias subject is not a valid legal name
    #[error(transparent)]
    LegalName(#[from] LegalNameError),
}

/// Invalid transport or revocation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// External-source revocation without a CRL source
    #[error("external-source revocation mode requires a CRL source")]
    MissingCrlSource,

    /// Unknown revocation mode name
    #[error("unknown revocation mode {0:?}")]
    UnknownRevocationMode(String),

    /// Builder was not given a key store
    #[error("no key store configured")]
    MissingKeyStore,

    /// Builder was not given a trust store
    #[error("no trust store configured")]
    MissingTrustStore,

    /// Key store holds no aliases
    #[error("key store contains no aliases")]
    EmptyKeyStore,

    /// Maximum message size of zero
    #[error("maximum message size must be positive")]
    InvalidMaxMessageSize,

    /// Empty protocol version allow-list
    #[error("no TLS protocol versions allowed")]
    NoProtocolVersions,

    /// Empty cipher suite allow-list
    #[error("no TLS cipher suites allowed")]
    NoCipherSuites,

    /// Liveness probe phrase configured as an empty string
    #[error("health check phrase must not be empty")]
    EmptyHealthCheckPhrase,
}

/// TLS configuration failure.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Key store lookup failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// None of the allowed cipher suites is supported by the provider
    #[error("no allowed cipher suite is supported by the crypto provider")]
    NoCipherSuites,

    /// rustls rejected the configuration
    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),

    /// Verifier could not be built from the trust anchors and CRLs
    #[error("verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    /// Target host or SNI token is not a valid server name
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
}

/// Protocol engine failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Frame could not be decoded
    #[error(transparent)]
    Protocol(#[from] peerlink_proto::ProtocolError),

    /// Peer broke the frame sequencing rules
    #[error("protocol violation: {0}")]
    Violation(String),

    /// Peer presented wrong credentials
    #[error("authentication failed for {0:?}")]
    AuthenticationFailed(String),

    /// Message body larger than allowed
    #[error("message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Body size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Engine already closed
    #[error("engine closed")]
    Closed,
}

/// Channel used out of order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Operation not valid in the current state
    #[error("invalid state {state:?} for operation {operation}")]
    InvalidState {
        /// Current state
        state: ChannelState,
        /// Operation attempted
        operation: &'static str,
    },
}

/// Outbound message rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Payload above the configured maximum
    #[error("payload of {size} bytes exceeds maximum message size of {max} bytes")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Limit
        max: usize,
    },
}
