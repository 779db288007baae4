//! TLS session factory.
//!
//! Builds the rustls client and server configurations for one connection
//! attempt. Both sides authenticate: the server requires a client certificate
//! and the client always verifies the server chain.
//!
//! # Peer naming
//!
//! Peers are identified by the legal name in their certificate subject, not
//! by DNS names. The verifiers here therefore accept a chain whose only fault
//! is a host-name mismatch; the channel checks the subject against the
//! allow-list once the handshake is done. Chain and revocation failures are
//! never ignored.
//!
//! # Crypto provider
//!
//! `ring` is always available. With the `aws-lc-rs` feature compiled in,
//! `use_native_tls` switches to aws-lc-rs; without it the flag is logged and
//! ignored.

use std::{collections::HashSet, sync::Arc};

use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
    client::{
        ClientSessionMemoryCache, ClientSessionStore, Resumption, WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    server::{
        ServerSessionMemoryCache, StoresServerSessions, WebPkiClientVerifier,
        danger::{ClientCertVerified, ClientCertVerifier},
    },
};
use tracing::{debug, warn};

use crate::{
    address::NetworkHostAndPort,
    config::TransportConfig,
    error::TlsError,
    identity::{self, IdentitySelection, SelectedIdentity},
    legal_name::LegalName,
    revocation::RevocationCheck,
};

/// Number of sessions kept for resumption.
pub const SESSION_CACHE_SIZE: usize = 256;

/// Client configuration for one connection attempt.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// rustls configuration
    pub config: Arc<ClientConfig>,
    /// Name sent as SNI and used for verification
    pub server_name: ServerName<'static>,
    /// Local identity offered, if any
    pub identity: Option<IdentitySelection>,
}

/// Server configuration for one accepted connection.
#[derive(Debug, Clone)]
pub struct ServerSession {
    /// rustls configuration
    pub config: Arc<ServerConfig>,
    /// Local identity offered, if any
    pub identity: Option<IdentitySelection>,
}

/// Shared client-side resumption store.
pub fn client_session_cache() -> Arc<dyn ClientSessionStore> {
    Arc::new(ClientSessionMemoryCache::new(SESSION_CACHE_SIZE))
}

/// Shared server-side resumption store.
pub fn server_session_cache() -> Arc<dyn StoresServerSessions> {
    ServerSessionMemoryCache::new(SESSION_CACHE_SIZE)
}

/// Crypto provider restricted to the configured cipher suites.
pub fn crypto_provider(config: &TransportConfig) -> Result<Arc<CryptoProvider>, TlsError> {
    let mut provider = base_provider(config.use_native_tls);
    provider.cipher_suites.retain(|suite| config.cipher_suites.contains(&suite.suite()));
    if provider.cipher_suites.is_empty() {
        return Err(TlsError::NoCipherSuites);
    }
    Ok(Arc::new(provider))
}

#[cfg(feature = "aws-lc-rs")]
fn base_provider(native: bool) -> CryptoProvider {
    if native {
        rustls::crypto::aws_lc_rs::default_provider()
    } else {
        rustls::crypto::ring::default_provider()
    }
}

#[cfg(not(feature = "aws-lc-rs"))]
fn base_provider(native: bool) -> CryptoProvider {
    if native {
        warn!("native TLS requested but aws-lc-rs support is not compiled in, using ring");
    }
    rustls::crypto::ring::default_provider()
}

/// Build the client side of a session to `target`.
///
/// With exactly one expected server name the SNI is that name's
/// [`sni_host_name`](LegalName::sni_host_name); otherwise the target host is
/// used.
pub fn build_client_session(
    target: &NetworkHostAndPort,
    expected: Option<&HashSet<LegalName>>,
    config: &TransportConfig,
    session_store: &Arc<dyn ClientSessionStore>,
) -> Result<ClientSession, TlsError> {
    let provider = crypto_provider(config)?;
    let versions = protocol_versions(config);

    let alias = identity::select_client_alias(
        config.key_store.as_ref(),
        config.source_legal_name.as_ref(),
        config.enable_sni,
    );
    let identity = alias
        .map(|alias| {
            identity::load_identity(
                config.key_store.as_ref(),
                &alias,
                &config.key_password,
                &provider,
            )
        })
        .transpose()?;
    if identity.is_none() {
        warn!(%target, "no local identity matches the source legal name");
    }

    let host = match expected {
        Some(names) if names.len() == 1 => {
            names.iter().next().map_or_else(|| target.host().to_string(), LegalName::sni_host_name)
        },
        _ => target.host().to_string(),
    };
    let server_name =
        ServerName::try_from(host.clone()).map_err(|_| TlsError::InvalidServerName(host))?;

    let verifier = server_verifier(config, &provider)?;
    let mut client = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_cert_resolver(Arc::new(SelectedIdentity::new(identity.as_ref())));
    client.resumption = Resumption::store(Arc::clone(session_store));

    debug!(%target, alias = identity.as_ref().map(|i| i.alias.as_str()), "built client session");
    Ok(ClientSession { config: Arc::new(client), server_name, identity })
}

/// Build the server side of a session for a ClientHello carrying `sni`.
pub fn build_server_session(
    config: &TransportConfig,
    sni: Option<&str>,
    session_cache: &Arc<dyn StoresServerSessions>,
) -> Result<ServerSession, TlsError> {
    let provider = crypto_provider(config)?;
    let versions = protocol_versions(config);

    let alias = identity::select_server_alias(config.key_store.as_ref(), sni, config.enable_sni);
    let identity = alias
        .map(|alias| {
            identity::load_identity(
                config.key_store.as_ref(),
                &alias,
                &config.key_password,
                &provider,
            )
        })
        .transpose()?;

    let verifier = client_verifier(config, &provider)?;
    let mut server = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&versions)?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(Arc::new(SelectedIdentity::new(identity.as_ref())));
    server.session_storage = Arc::clone(session_cache);

    Ok(ServerSession { config: Arc::new(server), identity })
}

fn protocol_versions(config: &TransportConfig) -> Vec<&'static rustls::SupportedProtocolVersion> {
    config.protocol_versions.iter().map(|v| v.rustls_version()).collect()
}

fn server_verifier(
    config: &TransportConfig,
    provider: &Arc<CryptoProvider>,
) -> Result<Arc<dyn ServerCertVerifier>, TlsError> {
    let roots = Arc::new(config.trust_store.root_cert_store()?);
    let check = config.revocation.resolve();

    let mut builder = WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(provider));
    if !check.crls.is_empty() {
        builder = builder.with_crls(check.crls.clone());
    }
    if check.allow_unknown {
        builder = builder.allow_unknown_revocation_status();
    }

    Ok(Arc::new(PeerServerVerifier { inner: builder.build()?, check }))
}

fn client_verifier(
    config: &TransportConfig,
    provider: &Arc<CryptoProvider>,
) -> Result<Arc<dyn ClientCertVerifier>, TlsError> {
    let roots = Arc::new(config.trust_store.root_cert_store()?);
    let check = config.revocation.resolve();

    let mut builder = WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(provider));
    if !check.crls.is_empty() {
        builder = builder.with_crls(check.crls.clone());
    }
    if check.allow_unknown {
        builder = builder.allow_unknown_revocation_status();
    }

    Ok(Arc::new(PeerClientVerifier { inner: builder.build()?, check }))
}

fn is_name_mismatch(error: &rustls::Error) -> bool {
    matches!(
        error,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

fn revocation_unavailable() -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::UnknownRevocationStatus)
}

/// Server chain verifier that ignores host-name mismatches.
#[derive(Debug)]
pub struct PeerServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    check: RevocationCheck,
}

impl ServerCertVerifier for PeerServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.check.unavailable {
            return Err(revocation_unavailable());
        }
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(e) if is_name_mismatch(&e) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Client chain verifier enforcing revocation availability.
#[derive(Debug)]
pub struct PeerClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    check: RevocationCheck,
}

impl ClientCertVerifier for PeerClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if self.check.unavailable {
            return Err(revocation_unavailable());
        }
        self.inner.verify_client_cert(end_entity, intermediates, now)
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_mismatch_is_recognised() {
        assert!(is_name_mismatch(&rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName
        )));
        assert!(!is_name_mismatch(&rustls::Error::InvalidCertificate(CertificateError::Revoked)));
        assert!(!is_name_mismatch(&rustls::Error::InvalidCertificate(
            CertificateError::UnknownIssuer
        )));
    }
}
