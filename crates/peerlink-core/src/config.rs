//! Transport configuration.
//!
//! A [`TransportConfig`] is built once, validated, and then shared read-only
//! (behind an `Arc`) by every connection of an endpoint.

use std::{collections::HashSet, fmt, net::IpAddr, sync::Arc, time::Duration};

use rustls::{CipherSuite, SupportedProtocolVersion};

use crate::{
    error::ConfigError,
    legal_name::LegalName,
    revocation::RevocationConfig,
    store::{CertificateStore, TrustStore},
};

/// Default time allowed for preamble sniffing plus the TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum message payload (10 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Cipher suites allowed unless configured otherwise.
pub const DEFAULT_CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
];

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// The rustls version descriptor.
    pub fn rustls_version(self) -> &'static SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Plaintext credentials presented when the engine opens.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account name
    pub username: String,
    /// Account secret
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).finish_non_exhaustive()
    }
}

/// Immutable configuration of one endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Signing identities
    pub key_store: Arc<dyn CertificateStore>,
    /// Trust anchors for peer chains
    pub trust_store: TrustStore,
    /// Unlock secret for private keys
    pub key_password: String,
    /// Largest accepted message payload
    pub max_message_size: usize,
    /// Revocation policy
    pub revocation: RevocationConfig,
    /// Engine credentials (sent by clients, required by servers)
    pub credentials: Option<Credentials>,
    /// Log per-frame traffic at debug instead of trace
    pub trace: bool,
    /// Liveness probe phrase; no sniffing when `None`
    pub health_check_phrase: Option<String>,
    /// Source addresses whose connection logs are demoted to debug
    pub silenced_ips: HashSet<IpAddr>,
    /// Deadline for preamble sniffing plus the TLS handshake
    pub handshake_timeout: Duration,
    /// Prefer the native (aws-lc-rs) crypto provider
    pub use_native_tls: bool,
    /// Select between several local identities by SNI
    pub enable_sni: bool,
    /// Identity a client connects as
    pub source_legal_name: Option<LegalName>,
    /// Allowed protocol versions
    pub protocol_versions: Vec<TlsVersion>,
    /// Allowed cipher suites
    pub cipher_suites: Vec<CipherSuite>,
}

impl TransportConfig {
    /// Start a builder.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }

    /// Whether connection logs for `ip` are demoted to debug.
    pub fn is_silenced(&self, ip: IpAddr) -> bool {
        self.silenced_ips.contains(&ip)
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug)]
pub struct TransportConfigBuilder {
    key_store: Option<Arc<dyn CertificateStore>>,
    trust_store: Option<TrustStore>,
    key_password: String,
    max_message_size: usize,
    revocation: RevocationConfig,
    credentials: Option<Credentials>,
    trace: bool,
    health_check_phrase: Option<String>,
    silenced_ips: HashSet<IpAddr>,
    handshake_timeout: Duration,
    use_native_tls: bool,
    enable_sni: bool,
    source_legal_name: Option<LegalName>,
    protocol_versions: Vec<TlsVersion>,
    cipher_suites: Vec<CipherSuite>,
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self {
            key_store: None,
            trust_store: None,
            key_password: String::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            revocation: RevocationConfig::off(),
            credentials: None,
            trace: false,
            health_check_phrase: None,
            silenced_ips: HashSet::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            use_native_tls: false,
            enable_sni: true,
            source_legal_name: None,
            protocol_versions: vec![TlsVersion::Tls12, TlsVersion::Tls13],
            cipher_suites: DEFAULT_CIPHER_SUITES.to_vec(),
        }
    }
}

impl TransportConfigBuilder {
    /// Signing identities.
    #[must_use]
    pub fn key_store(mut self, store: Arc<dyn CertificateStore>) -> Self {
        self.key_store = Some(store);
        self
    }

    /// Trust anchors.
    #[must_use]
    pub fn trust_store(mut self, store: TrustStore) -> Self {
        self.trust_store = Some(store);
        self
    }

    /// Private key unlock secret.
    #[must_use]
    pub fn key_password(mut self, password: impl Into<String>) -> Self {
        self.key_password = password.into();
        self
    }

    /// Largest accepted message payload.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Revocation policy.
    #[must_use]
    pub fn revocation(mut self, revocation: RevocationConfig) -> Self {
        self.revocation = revocation;
        self
    }

    /// Engine credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials =
            Some(Credentials { username: username.into(), password: password.into() });
        self
    }

    /// Per-frame traffic logging at debug.
    #[must_use]
    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Liveness probe phrase.
    #[must_use]
    pub fn health_check_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.health_check_phrase = Some(phrase.into());
        self
    }

    /// Demote connection logs from `ip` to debug.
    #[must_use]
    pub fn silence_ip(mut self, ip: IpAddr) -> Self {
        self.silenced_ips.insert(ip);
        self
    }

    /// Handshake deadline.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Prefer the native crypto provider.
    #[must_use]
    pub fn use_native_tls(mut self, native: bool) -> Self {
        self.use_native_tls = native;
        self
    }

    /// SNI-driven identity selection.
    #[must_use]
    pub fn enable_sni(mut self, enabled: bool) -> Self {
        self.enable_sni = enabled;
        self
    }

    /// Identity a client connects as.
    #[must_use]
    pub fn source_legal_name(mut self, name: LegalName) -> Self {
        self.source_legal_name = Some(name);
        self
    }

    /// Allowed protocol versions.
    #[must_use]
    pub fn protocol_versions(mut self, versions: Vec<TlsVersion>) -> Self {
        self.protocol_versions = versions;
        self
    }

    /// Allowed cipher suites.
    #[must_use]
    pub fn cipher_suites(mut self, suites: Vec<CipherSuite>) -> Self {
        self.cipher_suites = suites;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        let key_store = self.key_store.ok_or(ConfigError::MissingKeyStore)?;
        let trust_store = self.trust_store.ok_or(ConfigError::MissingTrustStore)?;

        if key_store.aliases().is_empty() {
            return Err(ConfigError::EmptyKeyStore);
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize);
        }
        if self.protocol_versions.is_empty() {
            return Err(ConfigError::NoProtocolVersions);
        }
        if self.cipher_suites.is_empty() {
            return Err(ConfigError::NoCipherSuites);
        }
        if self.health_check_phrase.as_deref() == Some("") {
            return Err(ConfigError::EmptyHealthCheckPhrase);
        }

        Ok(TransportConfig {
            key_store,
            trust_store,
            key_password: self.key_password,
            max_message_size: self.max_message_size,
            revocation: self.revocation,
            credentials: self.credentials,
            trace: self.trace,
            health_check_phrase: self.health_check_phrase,
            silenced_ips: self.silenced_ips,
            handshake_timeout: self.handshake_timeout,
            use_native_tls: self.use_native_tls,
            enable_sni: self.enable_sni,
            source_legal_name: self.source_legal_name,
            protocol_versions: self.protocol_versions,
            cipher_suites: self.cipher_suites,
        })
    }
}
