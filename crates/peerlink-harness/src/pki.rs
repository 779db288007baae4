//! Throwaway certificate authority.

use peerlink_core::{LegalName, TrustStore};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair,
    KeyUsagePurpose, RevocationReason, RevokedCertParams, SerialNumber, date_time_ymd,
};
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, PrivatePkcs8KeyDer,
};

use crate::HarnessError;

/// Root CA issuing node certificates and CRLs.
pub struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

/// Node certificate chain and key issued by a [`TestCa`].
#[derive(Debug, Clone)]
pub struct TestIdentity {
    /// Subject of the leaf
    pub legal_name: LegalName,
    /// Leaf then root
    pub chain: Vec<CertificateDer<'static>>,
    /// Leaf serial number
    pub serial: u8,
    key_der: Vec<u8>,
}

impl TestIdentity {
    /// Private key in PKCS#8.
    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key_der.clone()).into()
    }

    /// Leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }
}

impl TestCa {
    /// Create a self-signed root named `O=<organisation>, L=London, C=GB`.
    pub fn new(organisation: &str) -> Result<Self, HarnessError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, organisation);
        dn.push(DnType::LocalityName, "London");
        dn.push(DnType::CountryName, "GB");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    /// Root certificate.
    pub fn root(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Trust store holding only this root.
    pub fn trust_store(&self) -> TrustStore {
        TrustStore::new(vec![self.root()])
    }

    /// Issue a node certificate for `legal_name` with the given serial.
    pub fn issue(&self, legal_name: &LegalName, serial: u8) -> Result<TestIdentity, HarnessError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = distinguished_name(legal_name);
        params.serial_number = Some(SerialNumber::from_slice(&[0x10, serial]));
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages =
            vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &self.cert, &self.key)?;

        Ok(TestIdentity {
            legal_name: legal_name.clone(),
            chain: vec![cert.der().clone(), self.root()],
            serial,
            key_der: key.serialize_der(),
        })
    }

    /// CRL revoking `revoked`, valid until 2100.
    pub fn crl(
        &self,
        revoked: &[&TestIdentity],
    ) -> Result<CertificateRevocationListDer<'static>, HarnessError> {
        let params = CertificateRevocationListParams {
            this_update: date_time_ymd(2024, 1, 1),
            next_update: date_time_ymd(2100, 1, 1),
            crl_number: SerialNumber::from_slice(&[1]),
            issuing_distribution_point: None,
            revoked_certs: revoked
                .iter()
                .map(|identity| RevokedCertParams {
                    serial_number: SerialNumber::from_slice(&[0x10, identity.serial]),
                    revocation_time: date_time_ymd(2024, 1, 1),
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        Ok(params.signed_by(&self.cert, &self.key)?.der().clone())
    }
}

fn distinguished_name(name: &LegalName) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    if let Some(cn) = name.common_name() {
        dn.push(DnType::CommonName, cn);
    }
    if let Some(ou) = name.organisation_unit() {
        dn.push(DnType::OrganizationalUnitName, ou);
    }
    dn.push(DnType::OrganizationName, name.organisation());
    dn.push(DnType::LocalityName, name.locality());
    if let Some(st) = name.state() {
        dn.push(DnType::StateOrProvinceName, st);
    }
    dn.push(DnType::CountryName, name.country());
    dn
}
