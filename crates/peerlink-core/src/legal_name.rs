//! Node legal names.
//!
//! A legal name is the X.500 identity a node presents in its certificate
//! subject. Only six attributes are recognised:
//!
//! | Key | Attribute           | Required | Max length |
//! |-----|---------------------|----------|------------|
//! | CN  | common name         | no       | 64         |
//! | OU  | organisation unit   | no       | 64         |
//! | O   | organisation        | yes      | 128        |
//! | L   | locality            | yes      | 64         |
//! | ST  | state               | no       | 64         |
//! | C   | country (ISO alpha-2) | yes    | 2          |
//!
//! The canonical string form lists attributes in the order of the table,
//! separated by `", "`. Two names are equal when all attributes are equal,
//! regardless of the order they were parsed in.

use std::{fmt, str::FromStr};

use sha2::{Digest, Sha256};
use x509_parser::{
    oid_registry::{
        OID_X509_COMMON_NAME, OID_X509_COUNTRY_NAME, OID_X509_LOCALITY_NAME,
        OID_X509_ORGANIZATION_NAME, OID_X509_ORGANIZATIONAL_UNIT, OID_X509_STATE_OR_PROVINCE_NAME,
    },
    prelude::{FromDer, X509Certificate},
};

use crate::error::LegalNameError;

/// Suffix appended to the hashed name to form an SNI host name.
pub const SNI_SUFFIX: &str = ".p2p.node";

/// Number of hex characters of the name hash used in the SNI host name.
const SNI_HASH_CHARS: usize = 32;

const FORBIDDEN_CHARS: [char; 3] = [',', '=', '"'];

/// Canonical identity of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LegalName {
    common_name: Option<String>,
    organisation_unit: Option<String>,
    organisation: String,
    locality: String,
    state: Option<String>,
    country: String,
}

impl LegalName {
    /// Create a name from its mandatory attributes.
    pub fn new(
        organisation: impl Into<String>,
        locality: impl Into<String>,
        country: impl Into<String>,
    ) -> Result<Self, LegalNameError> {
        Self::from_parts(Parts {
            organisation: Some(organisation.into()),
            locality: Some(locality.into()),
            country: Some(country.into()),
            ..Parts::default()
        })
    }

    /// Set the common name.
    pub fn with_common_name(
        mut self,
        common_name: impl Into<String>,
    ) -> Result<Self, LegalNameError> {
        let common_name = common_name.into();
        validate("CN", &common_name, 64)?;
        self.common_name = Some(common_name);
        Ok(self)
    }

    /// Set the organisation unit.
    pub fn with_organisation_unit(
        mut self,
        unit: impl Into<String>,
    ) -> Result<Self, LegalNameError> {
        let unit = unit.into();
        validate("OU", &unit, 64)?;
        self.organisation_unit = Some(unit);
        Ok(self)
    }

    /// Set the state or province.
    pub fn with_state(mut self, state: impl Into<String>) -> Result<Self, LegalNameError> {
        let state = state.into();
        validate("ST", &state, 64)?;
        self.state = Some(state);
        Ok(self)
    }

    /// Parse the subject of a DER-encoded X.509 certificate.
    pub fn from_certificate(der: &[u8]) -> Result<Self, LegalNameError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| LegalNameError::Certificate(e.to_string()))?;

        let mut parts = Parts::default();
        for attribute in cert.subject().iter_attributes() {
            let oid = attribute.attr_type();
            let key = if *oid == OID_X509_COMMON_NAME {
                "CN"
            } else if *oid == OID_X509_ORGANIZATIONAL_UNIT {
                "OU"
            } else if *oid == OID_X509_ORGANIZATION_NAME {
                "O"
            } else if *oid == OID_X509_LOCALITY_NAME {
                "L"
            } else if *oid == OID_X509_STATE_OR_PROVINCE_NAME {
                "ST"
            } else if *oid == OID_X509_COUNTRY_NAME {
                "C"
            } else {
                return Err(LegalNameError::UnsupportedAttribute(oid.to_id_string()));
            };
            let value = attribute.as_str().map_err(|e| LegalNameError::InvalidValue {
                attribute: key,
                reason: e.to_string(),
            })?;
            parts.set(key, value)?;
        }

        Self::from_parts(parts)
    }

    /// Common name, if any.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Organisation unit, if any.
    pub fn organisation_unit(&self) -> Option<&str> {
        self.organisation_unit.as_deref()
    }

    /// Organisation.
    pub fn organisation(&self) -> &str {
        &self.organisation
    }

    /// Locality.
    pub fn locality(&self) -> &str {
        &self.locality
    }

    /// State or province, if any.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// Two-letter country code.
    pub fn country(&self) -> &str {
        &self.country
    }

    /// Hostname-safe token identifying this name in the TLS SNI extension.
    ///
    /// First 32 hex characters of the SHA-256 of the canonical string form,
    /// followed by `.p2p.node`.
    pub fn sni_host_name(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut host = hex::encode(digest);
        host.truncate(SNI_HASH_CHARS);
        host.push_str(SNI_SUFFIX);
        host
    }

    fn from_parts(parts: Parts) -> Result<Self, LegalNameError> {
        let organisation = parts.organisation.ok_or(LegalNameError::MissingAttribute("O"))?;
        let locality = parts.locality.ok_or(LegalNameError::MissingAttribute("L"))?;
        let country = parts.country.ok_or(LegalNameError::MissingAttribute("C"))?;

        validate("O", &organisation, 128)?;
        validate("L", &locality, 64)?;
        validate_country(&country)?;
        for (key, value) in [
            ("CN", &parts.common_name),
            ("OU", &parts.organisation_unit),
            ("ST", &parts.state),
        ] {
            if let Some(value) = value {
                validate(key, value, 64)?;
            }
        }

        Ok(Self {
            common_name: parts.common_name,
            organisation_unit: parts.organisation_unit,
            organisation,
            locality,
            state: parts.state,
            country,
        })
    }
}

#[derive(Default)]
struct Parts {
    common_name: Option<String>,
    organisation_unit: Option<String>,
    organisation: Option<String>,
    locality: Option<String>,
    state: Option<String>,
    country: Option<String>,
}

impl Parts {
    fn set(&mut self, key: &str, value: &str) -> Result<(), LegalNameError> {
        let (name, slot) = match key.to_ascii_uppercase().as_str() {
            "CN" => ("CN", &mut self.common_name),
            "OU" => ("OU", &mut self.organisation_unit),
            "O" => ("O", &mut self.organisation),
            "L" => ("L", &mut self.locality),
            "ST" => ("ST", &mut self.state),
            "C" => ("C", &mut self.country),
            _ => return Err(LegalNameError::UnsupportedAttribute(key.to_string())),
        };
        if slot.is_some() {
            return Err(LegalNameError::DuplicateAttribute(name));
        }
        *slot = Some(value.to_string());
        Ok(())
    }
}

fn validate(attribute: &'static str, value: &str, max_len: usize) -> Result<(), LegalNameError> {
    let invalid = |reason: &str| LegalNameError::InvalidValue { attribute, reason: reason.into() };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.chars().count() > max_len {
        return Err(invalid(&format!("longer than {max_len} characters")));
    }
    if value.trim() != value {
        return Err(invalid("leading or trailing whitespace"));
    }
    if value.chars().any(|c| FORBIDDEN_CHARS.contains(&c) || c.is_control()) {
        return Err(invalid("contains a forbidden character"));
    }
    Ok(())
}

fn validate_country(country: &str) -> Result<(), LegalNameError> {
    if country.len() == 2 && country.bytes().all(|b| b.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(LegalNameError::InvalidValue {
            attribute: "C",
            reason: "must be a two-letter upper-case country code".into(),
        })
    }
}

impl FromStr for LegalName {
    type Err = LegalNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = Parts::default();
        for component in s.split(',') {
            let (key, value) = component
                .split_once('=')
                .ok_or_else(|| LegalNameError::MalformedComponent(component.to_string()))?;
            parts.set(key.trim(), value.trim())?;
        }
        Self::from_parts(parts)
    }
}

impl fmt::Display for LegalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attributes = [
            ("CN", self.common_name.as_deref()),
            ("OU", self.organisation_unit.as_deref()),
            ("O", Some(self.organisation.as_str())),
            ("L", Some(self.locality.as_str())),
            ("ST", self.state.as_deref()),
            ("C", Some(self.country.as_str())),
        ];
        let mut first = true;
        for (key, value) in attributes {
            if let Some(value) = value {
                if !first {
                    f.write_str(", ")?;
                }
                write!(f, "{key}={value}")?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    use super::*;

    fn self_signed(dn: DistinguishedName) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = dn;
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn parse_is_order_insensitive_and_canonicalises() {
        let a: LegalName = "C=GB, L=London, O=Bank A".parse().unwrap();
        let b: LegalName = "O=Bank A,L=London,C=GB".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "O=Bank A, L=London, C=GB");
    }

    #[test]
    fn display_orders_all_attributes() {
        let name: LegalName = "C=US, ST=NY, O=Bank, CN=Node, L=New York, OU=Ops".parse().unwrap();
        assert_eq!(name.to_string(), "CN=Node, OU=Ops, O=Bank, L=New York, ST=NY, C=US");
    }

    #[test]
    fn rejects_missing_and_unknown_attributes() {
        assert_eq!(
            "O=Bank, C=GB".parse::<LegalName>(),
            Err(LegalNameError::MissingAttribute("L"))
        );
        assert!(matches!(
            "O=Bank, L=London, C=GB, E=x@y".parse::<LegalName>(),
            Err(LegalNameError::UnsupportedAttribute(_))
        ));
        assert_eq!(
            "O=Bank, O=Other, L=London, C=GB".parse::<LegalName>(),
            Err(LegalNameError::DuplicateAttribute("O"))
        );
    }

    #[test]
    fn rejects_bad_country() {
        assert!(LegalName::new("Bank", "London", "gb").is_err());
        assert!(LegalName::new("Bank", "London", "GBR").is_err());
    }

    #[test]
    fn rejects_forbidden_characters() {
        assert!(LegalName::new("Bank \"A\"", "London", "GB").is_err());
        assert!(LegalName::new(" Bank", "London", "GB").is_err());
    }

    #[test]
    fn sni_host_name_has_fixed_shape() {
        let name = LegalName::new("Bank A", "London", "GB").unwrap();
        let host = name.sni_host_name();
        assert!(host.ends_with(".p2p.node"));
        assert_eq!(host.len(), 32 + ".p2p.node".len());
        assert!(host[..32].bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(host, LegalName::new("Bank B", "London", "GB").unwrap().sni_host_name());
    }

    #[test]
    fn reads_certificate_subject() {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, "GB");
        dn.push(DnType::OrganizationName, "Bank A");
        dn.push(DnType::LocalityName, "London");
        let name = LegalName::from_certificate(&self_signed(dn)).unwrap();
        assert_eq!(name, LegalName::new("Bank A", "London", "GB").unwrap());
    }

    #[test]
    fn certificate_subject_with_extra_attribute_is_rejected() {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Bank A");
        dn.push(DnType::LocalityName, "London");
        dn.push(DnType::CountryName, "GB");
        dn.push(DnType::CustomDnType(vec![1, 2, 840, 113_549, 1, 9, 1]), "x@example.com");
        assert!(matches!(
            LegalName::from_certificate(&self_signed(dn)),
            Err(LegalNameError::UnsupportedAttribute(_))
        ));
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        assert!(matches!(
            LegalName::from_certificate(b"not a certificate"),
            Err(LegalNameError::Certificate(_))
        ));
    }

    proptest! {
        #[test]
        fn display_parses_back(
            org in "[A-Za-z][A-Za-z0-9 ]{0,30}[A-Za-z0-9]",
            city in "[A-Za-z]{2,20}",
            country in "[A-Z]{2}",
        ) {
            let name = LegalName::new(org, city, country).unwrap();
            prop_assert_eq!(name.to_string().parse::<LegalName>().unwrap(), name);
        }
    }
}
