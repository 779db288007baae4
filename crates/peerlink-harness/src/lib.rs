//! Test fixtures for Peerlink.
//!
//! Provides a throwaway PKI built with `rcgen` (a root CA, node certificates
//! whose subjects are legal names, and CRLs), key stores wired from those
//! identities, and small helpers for waiting on endpoint event streams from
//! synchronous tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod pki;
pub mod wait;

use std::sync::Arc;

use peerlink_core::{
    CertificateStore, LegalName, MemoryCertificateStore, StoreError, TransportConfig,
    TransportConfigBuilder,
};
pub use pki::{TestCa, TestIdentity};
use thiserror::Error;
pub use wait::{recv_matching, recv_within, wait_until};

/// Unlock secret used for every test key.
pub const KEY_PASSWORD: &str = "peerlink-test";

/// Harness setup failure.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Certificate or CRL generation failed
    #[error("rcgen: {0}")]
    Rcgen(#[from] rcgen::Error),

    /// Key store rejected an identity
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `O=Alice Corp, L=Madrid, C=ES`
pub fn alice() -> LegalName {
    legal_name("Alice Corp", "Madrid", "ES")
}

/// `O=Bob Plc, L=Rome, C=IT`
pub fn bob() -> LegalName {
    legal_name("Bob Plc", "Rome", "IT")
}

/// `O=Charlie Ltd, L=Athens, C=GR`
pub fn charlie() -> LegalName {
    legal_name("Charlie Ltd", "Athens", "GR")
}

fn legal_name(organisation: &str, locality: &str, country: &str) -> LegalName {
    match LegalName::new(organisation, locality, country) {
        Ok(name) => name,
        Err(e) => unreachable!("fixture legal name is valid: {e}"),
    }
}

/// Key store holding `identities`, one alias per identity named after its
/// legal name. The first identity is the default alias.
pub fn store_with(identities: &[&TestIdentity]) -> Result<Arc<dyn CertificateStore>, HarnessError> {
    let mut store = MemoryCertificateStore::new();
    for identity in identities {
        store.insert(
            identity.legal_name.to_string(),
            identity.chain.clone(),
            identity.key(),
            KEY_PASSWORD,
        )?;
    }
    Ok(store.into_shared())
}

/// Config builder with `identities` as key store and `ca` as trust anchor.
///
/// Uses a 5 second handshake timeout so failing tests do not hang.
pub fn config_builder(
    ca: &TestCa,
    identities: &[&TestIdentity],
) -> Result<TransportConfigBuilder, HarnessError> {
    Ok(TransportConfig::builder()
        .key_store(store_with(identities)?)
        .trust_store(ca.trust_store())
        .key_password(KEY_PASSWORD)
        .handshake_timeout(std::time::Duration::from_secs(5)))
}

/// Install a test-friendly tracing subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
