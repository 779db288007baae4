//! Signing key store and trust store.
//!
//! [`CertificateStore`] is the read-only view the TLS layer needs over a
//! node's signing identities: a set of aliases, each with a certificate chain
//! (leaf first) and a private key guarded by an unlock secret. A node that
//! hosts several identities keeps one alias per identity and lets the
//! [`identity`](crate::identity) module pick between them.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fs::File,
    io::BufReader,
    path::Path,
    sync::Arc,
};

use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer},
};

use crate::{error::StoreError, legal_name::LegalName};

/// Read-only access to signing identities.
pub trait CertificateStore: Send + Sync + fmt::Debug {
    /// All aliases held by the store.
    fn aliases(&self) -> BTreeSet<String>;

    /// Certificate chain for `alias`, leaf first.
    fn certificate_chain(&self, alias: &str) -> Result<Vec<CertificateDer<'static>>, StoreError>;

    /// Private key for `alias`, unlocked with `secret`.
    fn private_key(&self, alias: &str, secret: &str) -> Result<PrivateKeyDer<'static>, StoreError>;

    /// Alias used when no selection applies.
    fn default_alias(&self) -> Option<String> {
        self.aliases().into_iter().next()
    }

    /// Legal name in the subject of the alias' leaf certificate.
    fn subject_identity(&self, alias: &str) -> Result<LegalName, StoreError> {
        let chain = self.certificate_chain(alias)?;
        let leaf = chain.first().ok_or_else(|| StoreError::EmptyChain(alias.to_string()))?;
        Ok(LegalName::from_certificate(leaf)?)
    }
}

struct Entry {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    secret: String,
}

/// In-memory [`CertificateStore`].
#[derive(Default)]
pub struct MemoryCertificateStore {
    entries: BTreeMap<String, Entry>,
    default_alias: Option<String>,
}

impl MemoryCertificateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an identity.
    ///
    /// The first alias inserted becomes the default.
    pub fn insert(
        &mut self,
        alias: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        secret: impl Into<String>,
    ) -> Result<(), StoreError> {
        let alias = alias.into();
        if chain.is_empty() {
            return Err(StoreError::EmptyChain(alias));
        }
        if self.default_alias.is_none() {
            self.default_alias = Some(alias.clone());
        }
        self.entries.insert(alias, Entry { chain, key, secret: secret.into() });
        Ok(())
    }

    /// Add an identity read from a PEM certificate chain and a PEM private key.
    pub fn insert_pem_files(
        &mut self,
        alias: impl Into<String>,
        chain_path: &Path,
        key_path: &Path,
        secret: impl Into<String>,
    ) -> Result<(), StoreError> {
        let chain = read_certificates(chain_path)?;
        let mut reader = open(key_path)?;
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|source| StoreError::Pem { path: key_path.to_path_buf(), source })?
            .ok_or_else(|| StoreError::NoPrivateKey(key_path.to_path_buf()))?;
        self.insert(alias, chain, key, secret)
    }

    /// Wrap into a shared trait object.
    pub fn into_shared(self) -> Arc<dyn CertificateStore> {
        Arc::new(self)
    }

    fn entry(&self, alias: &str) -> Result<&Entry, StoreError> {
        self.entries.get(alias).ok_or_else(|| StoreError::UnknownAlias(alias.to_string()))
    }
}

impl fmt::Debug for MemoryCertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCertificateStore")
            .field("aliases", &self.entries.keys().collect::<Vec<_>>())
            .field("default_alias", &self.default_alias)
            .finish_non_exhaustive()
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn aliases(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    fn certificate_chain(&self, alias: &str) -> Result<Vec<CertificateDer<'static>>, StoreError> {
        Ok(self.entry(alias)?.chain.clone())
    }

    fn private_key(&self, alias: &str, secret: &str) -> Result<PrivateKeyDer<'static>, StoreError> {
        let entry = self.entry(alias)?;
        if entry.secret != secret {
            return Err(StoreError::KeyLocked(alias.to_string()));
        }
        Ok(entry.key.clone_key())
    }

    fn default_alias(&self) -> Option<String> {
        self.default_alias.clone()
    }
}

/// Trust anchors used to validate peer chains.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    anchors: Vec<CertificateDer<'static>>,
}

impl TrustStore {
    /// Create a store from DER certificates.
    pub fn new(anchors: Vec<CertificateDer<'static>>) -> Self {
        Self { anchors }
    }

    /// Read anchors from a PEM file.
    pub fn from_pem_file(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(read_certificates(path)?))
    }

    /// Add an anchor.
    pub fn add(&mut self, anchor: CertificateDer<'static>) {
        self.anchors.push(anchor);
    }

    /// Anchors in insertion order.
    pub fn anchors(&self) -> &[CertificateDer<'static>] {
        &self.anchors
    }

    /// Convert into a rustls root store.
    pub fn root_cert_store(&self) -> Result<RootCertStore, StoreError> {
        let mut roots = RootCertStore::empty();
        for anchor in &self.anchors {
            roots.add(anchor.clone()).map_err(|e| StoreError::InvalidAnchor(e.to_string()))?;
        }
        Ok(roots)
    }
}

fn open(path: &Path) -> Result<BufReader<File>, StoreError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| StoreError::Pem { path: path.to_path_buf(), source })
}

pub(crate) fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, StoreError> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| StoreError::Pem { path: path.to_path_buf(), source })
}
