//! Certificate revocation policy.
//!
//! The policy decides which CRLs are handed to the webpki verifiers and how
//! an unknown revocation status is treated:
//!
//! | Mode             | CRLs from              | Unknown status |
//! |------------------|------------------------|----------------|
//! | `Off`            | none, no checking      | n/a            |
//! | `SoftFail`       | configured CRL cache   | tolerated      |
//! | `HardFail`       | configured CRL cache   | rejected       |
//! | `ExternalSource` | injected [`CrlSource`] | tolerated      |
//!
//! Under `HardFail` an empty CRL cache makes every peer's status unknown, so
//! every peer is rejected.

use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use rustls::pki_types::CertificateRevocationListDer;
use tracing::warn;

use crate::error::{ConfigError, StoreError};

/// How certificate revocation is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevocationMode {
    /// Chain validation only
    Off,
    /// Check against cached CRLs, tolerate unknown status
    SoftFail,
    /// Check against cached CRLs, reject unknown status
    HardFail,
    /// Check against CRLs supplied by an external [`CrlSource`]
    ExternalSource,
}

impl FromStr for RevocationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "off" => Ok(Self::Off),
            "softfail" => Ok(Self::SoftFail),
            "hardfail" => Ok(Self::HardFail),
            "externalsource" => Ok(Self::ExternalSource),
            _ => Err(ConfigError::UnknownRevocationMode(s.to_string())),
        }
    }
}

/// Provider of revocation lists consulted each time a session is built.
pub trait CrlSource: Send + Sync + fmt::Debug {
    /// Fetch the current CRLs.
    fn fetch(&self) -> Result<Vec<CertificateRevocationListDer<'static>>, StoreError>;
}

/// [`CrlSource`] re-reading PEM files on every fetch.
#[derive(Debug, Clone)]
pub struct FileCrlSource {
    paths: Vec<PathBuf>,
}

impl FileCrlSource {
    /// Read CRLs from `paths`.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl CrlSource for FileCrlSource {
    fn fetch(&self) -> Result<Vec<CertificateRevocationListDer<'static>>, StoreError> {
        let mut crls = Vec::new();
        for path in &self.paths {
            crls.extend(read_crls(path)?);
        }
        Ok(crls)
    }
}

/// Read every CRL in a PEM file.
pub fn read_crls(
    path: &std::path::Path,
) -> Result<Vec<CertificateRevocationListDer<'static>>, StoreError> {
    let file = std::fs::File::open(path)
        .map_err(|source| StoreError::Pem { path: path.to_path_buf(), source })?;
    rustls_pemfile::crls(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| StoreError::Pem { path: path.to_path_buf(), source })
}

/// Configured revocation policy.
#[derive(Debug, Clone)]
pub struct RevocationConfig {
    mode: RevocationMode,
    crls: Vec<CertificateRevocationListDer<'static>>,
    source: Option<Arc<dyn CrlSource>>,
}

/// Revocation inputs for one verifier build.
#[derive(Debug, Clone, Default)]
pub struct RevocationCheck {
    /// CRLs to load into the verifier
    pub crls: Vec<CertificateRevocationListDer<'static>>,
    /// Whether an unknown status is accepted
    pub allow_unknown: bool,
    /// Revocation data is required but none is available
    pub unavailable: bool,
}

impl RevocationConfig {
    /// Create a policy. `ExternalSource` requires `source`.
    pub fn new(
        mode: RevocationMode,
        source: Option<Arc<dyn CrlSource>>,
    ) -> Result<Self, ConfigError> {
        if mode == RevocationMode::ExternalSource && source.is_none() {
            return Err(ConfigError::MissingCrlSource);
        }
        Ok(Self { mode, crls: Vec::new(), source })
    }

    /// Policy with revocation checking disabled.
    pub fn off() -> Self {
        Self { mode: RevocationMode::Off, crls: Vec::new(), source: None }
    }

    /// Set the cached CRLs used by `SoftFail` and `HardFail`.
    #[must_use]
    pub fn with_crls(mut self, crls: Vec<CertificateRevocationListDer<'static>>) -> Self {
        self.crls = crls;
        self
    }

    /// Configured mode.
    pub fn mode(&self) -> RevocationMode {
        self.mode
    }

    /// Work out the CRLs and unknown-status handling for a verifier.
    pub fn resolve(&self) -> RevocationCheck {
        match self.mode {
            RevocationMode::Off => RevocationCheck::default(),
            RevocationMode::SoftFail => {
                RevocationCheck { crls: self.crls.clone(), allow_unknown: true, unavailable: false }
            },
            RevocationMode::HardFail => RevocationCheck {
                crls: self.crls.clone(),
                allow_unknown: false,
                unavailable: self.crls.is_empty(),
            },
            RevocationMode::ExternalSource => {
                let crls = match self.source.as_ref().map(|source| source.fetch()) {
                    Some(Ok(crls)) => crls,
                    Some(Err(e)) => {
                        warn!(error = %e, "external CRL source failed, continuing without CRLs");
                        Vec::new()
                    },
                    None => Vec::new(),
                };
                RevocationCheck { crls, allow_unknown: true, unavailable: false }
            },
        }
    }
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self::off()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CrlSource for CountingSource {
        fn fetch(&self) -> Result<Vec<CertificateRevocationListDer<'static>>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(StoreError::UnknownAlias("crl".into()))
            } else {
                Ok(vec![CertificateRevocationListDer::from(vec![1, 2, 3])])
            }
        }
    }

    #[test]
    fn external_source_requires_source() {
        assert_eq!(
            RevocationConfig::new(RevocationMode::ExternalSource, None).unwrap_err(),
            ConfigError::MissingCrlSource
        );
    }

    #[test]
    fn hard_fail_without_crls_is_unavailable() {
        let check = RevocationConfig::new(RevocationMode::HardFail, None).unwrap().resolve();
        assert!(check.unavailable);
        assert!(!check.allow_unknown);
    }

    #[test]
    fn soft_fail_tolerates_unknown() {
        let crl = CertificateRevocationListDer::from(vec![9]);
        let check = RevocationConfig::new(RevocationMode::SoftFail, None)
            .unwrap()
            .with_crls(vec![crl])
            .resolve();
        assert!(check.allow_unknown);
        assert_eq!(check.crls.len(), 1);
    }

    #[test]
    fn external_source_is_consulted_on_every_resolve() {
        let source = Arc::new(CountingSource::default());
        let config =
            RevocationConfig::new(RevocationMode::ExternalSource, Some(source.clone())).unwrap();
        assert_eq!(config.resolve().crls.len(), 1);
        config.resolve();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn external_source_failure_is_soft() {
        let source = Arc::new(CountingSource { fail: true, ..CountingSource::default() });
        let check =
            RevocationConfig::new(RevocationMode::ExternalSource, Some(source)).unwrap().resolve();
        assert!(check.crls.is_empty());
        assert!(check.allow_unknown);
        assert!(!check.unavailable);
    }

    #[test]
    fn mode_parses_common_spellings() {
        assert_eq!("SOFT_FAIL".parse::<RevocationMode>().unwrap(), RevocationMode::SoftFail);
        assert_eq!("hard-fail".parse::<RevocationMode>().unwrap(), RevocationMode::HardFail);
        assert_eq!("off".parse::<RevocationMode>().unwrap(), RevocationMode::Off);
        assert!("sometimes".parse::<RevocationMode>().is_err());
    }
}
