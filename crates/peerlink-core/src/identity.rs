//! Selection of the local identity presented during a handshake.
//!
//! A node may hold several signing identities in one store. The server picks
//! the identity whose SNI host name matches what the client asked for; the
//! client picks the identity whose subject equals its configured source name.
//! Selection is a pure function of the store contents and the hint, so two
//! concurrent handshakes can never observe each other's choice.

use std::sync::Arc;

use rustls::{
    SignatureScheme,
    client::ResolvesClientCert,
    crypto::CryptoProvider,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::{debug, warn};

use crate::{
    error::TlsError,
    legal_name::LegalName,
    store::CertificateStore,
};

/// Alias chosen for a handshake, with its loaded key material.
#[derive(Debug, Clone)]
pub struct IdentitySelection {
    /// Store alias
    pub alias: String,
    /// Subject of the alias' leaf, if it parses as a legal name
    pub legal_name: Option<LegalName>,
    /// Chain and signing key ready for rustls
    pub certified_key: Arc<CertifiedKey>,
}

/// Pick the alias a server presents for a ClientHello carrying `sni`.
///
/// With multi-identity disabled, or only one alias in the store, the default
/// alias is used regardless of SNI. Otherwise the alias whose subject hashes
/// to exactly `sni` is returned; no SNI or no match yields `None`.
pub fn select_server_alias(
    store: &dyn CertificateStore,
    sni: Option<&str>,
    sni_enabled: bool,
) -> Option<String> {
    let aliases = store.aliases();
    if !sni_enabled || aliases.len() <= 1 {
        return store.default_alias();
    }

    let Some(sni) = sni else {
        debug!("ClientHello carries no SNI, no identity selected");
        return None;
    };

    let selected = aliases.into_iter().find(|alias| match store.subject_identity(alias) {
        Ok(name) => name.sni_host_name() == sni,
        Err(e) => {
            warn!(alias, error = %e, "skipping alias with unusable subject");
            false
        },
    });
    if selected.is_none() {
        debug!(sni, "no alias matches SNI");
    }
    selected
}

/// Pick the alias a client presents when connecting as `source`.
///
/// With multi-identity disabled, a single alias, or no configured source, the
/// default alias is used. Otherwise the first alias whose subject equals
/// `source` wins; no match yields `None`.
pub fn select_client_alias(
    store: &dyn CertificateStore,
    source: Option<&LegalName>,
    sni_enabled: bool,
) -> Option<String> {
    let aliases = store.aliases();
    let Some(source) = source.filter(|_| sni_enabled && aliases.len() > 1) else {
        return store.default_alias();
    };

    aliases
        .into_iter()
        .find(|alias| store.subject_identity(alias).is_ok_and(|name| &name == source))
}

/// Load the chain and key of `alias` into a rustls [`CertifiedKey`].
pub fn load_identity(
    store: &dyn CertificateStore,
    alias: &str,
    secret: &str,
    provider: &CryptoProvider,
) -> Result<IdentitySelection, TlsError> {
    let chain = store.certificate_chain(alias)?;
    let key = store.private_key(alias, secret)?;
    let signing_key = provider.key_provider.load_private_key(key)?;
    let legal_name = store.subject_identity(alias).ok();

    Ok(IdentitySelection {
        alias: alias.to_string(),
        legal_name,
        certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
    })
}

/// Resolver handing rustls an identity chosen before the config was built.
///
/// `None` means no certificate is offered: a server then fails the handshake,
/// a client sends an empty certificate message.
#[derive(Debug, Clone)]
pub struct SelectedIdentity(Option<Arc<CertifiedKey>>);

impl SelectedIdentity {
    /// Wrap an optional selection.
    pub fn new(selection: Option<&IdentitySelection>) -> Self {
        Self(selection.map(|s| Arc::clone(&s.certified_key)))
    }
}

impl ResolvesServerCert for SelectedIdentity {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.0.clone()
    }
}

impl ResolvesClientCert for SelectedIdentity {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.0.clone()
    }

    fn has_certs(&self) -> bool {
        self.0.is_some()
    }
}
