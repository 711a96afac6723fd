//! Root and leaf certificate generation
//!
//! Root certificates are self-signed with `CA: true` and certificate-signing
//! key usage; leaf certificates are signed by the root and restricted to TLS
//! server authentication.

use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use time::OffsetDateTime;
use tracing::{debug, info};
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;
use zeroize::Zeroizing;

use crate::{fingerprint, GenerationError};

/// Default root CA validity: two years.
pub const DEFAULT_ROOT_VALIDITY_DAYS: u32 = 730;
/// Default leaf validity: one year.
pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 365;
/// Root CA key size.
pub const ROOT_KEY_BITS: usize = 4096;
/// Leaf key size.
pub const LEAF_KEY_BITS: usize = 2048;

/// Certificate subject fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectInfo {
    pub common_name: String,
    pub organization: Option<String>,
    pub country: Option<String>,
}

impl SubjectInfo {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            country: None,
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    fn validate(&self) -> Result<(), GenerationError> {
        if self.common_name.trim().is_empty() {
            return Err(GenerationError::InvalidInput(
                "subject common name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn to_distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.clone());
        if let Some(ref org) = self.organization {
            dn.push(DnType::OrganizationName, org.clone());
        }
        if let Some(ref country) = self.country {
            dn.push(DnType::CountryName, country.clone());
        }
        dn
    }
}

/// An RSA private key held as PKCS#8 DER, zeroized on drop.
///
/// Key material is never persisted independently of its certificate; callers
/// hand it to [`crate::bundle_private_key`] or serialize it to a 0600 PEM
/// file alongside the certificate it belongs to.
pub struct KeyMaterial {
    pkcs8_der: Zeroizing<Vec<u8>>,
}

impl KeyMaterial {
    pub(crate) fn from_pkcs8_der(der: Vec<u8>) -> Self {
        Self {
            pkcs8_der: Zeroizing::new(der),
        }
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }

    /// Serialize to PKCS#8 PEM. The returned buffer is zeroized on drop.
    pub fn to_pem(&self) -> Result<Zeroizing<String>, GenerationError> {
        Ok(Zeroizing::new(self.rcgen_key_pair()?.serialize_pem()))
    }

    /// The SubjectPublicKeyInfo DER for this key.
    pub fn public_key_der(&self) -> Result<Vec<u8>, GenerationError> {
        Ok(self.rcgen_key_pair()?.public_key_der())
    }

    pub(crate) fn rcgen_key_pair(&self) -> Result<rcgen::KeyPair, GenerationError> {
        let der = PrivatePkcs8KeyDer::from(self.pkcs8_der.as_slice());
        rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&der, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| GenerationError::SigningFailed(format!("unusable key material: {e}")))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// A self-signed trust anchor
#[derive(Debug, Clone)]
pub struct RootCertificate {
    pub der: Vec<u8>,
    pub pem: String,
    pub fingerprint: String,
}

/// A CA-signed server-authentication certificate
#[derive(Debug, Clone)]
pub struct LeafCertificate {
    pub der: Vec<u8>,
    pub pem: String,
    pub fingerprint: String,
}

/// Generate a self-signed root CA certificate with the default key size.
pub fn generate_root_certificate(
    subject: &SubjectInfo,
    validity_days: u32,
) -> Result<(RootCertificate, KeyMaterial), GenerationError> {
    generate_root_certificate_with_bits(subject, validity_days, ROOT_KEY_BITS)
}

/// Generate a self-signed root CA certificate.
///
/// The certificate carries `CA: true` and certificate-signing key usage, and
/// is signed with SHA-256. `validity_days` must be positive and the subject
/// common name non-empty.
pub fn generate_root_certificate_with_bits(
    subject: &SubjectInfo,
    validity_days: u32,
    key_bits: usize,
) -> Result<(RootCertificate, KeyMaterial), GenerationError> {
    subject.validate()?;
    let validity = positive_validity(validity_days)?;

    let key = generate_rsa_key(key_bits)?;
    let key_pair = key.rcgen_key_pair()?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject.to_distinguished_name();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    set_validity(&mut params, validity);
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| GenerationError::GenerationFailed(e.to_string()))?;

    let der = cert.der().to_vec();
    let root = RootCertificate {
        fingerprint: fingerprint(&der),
        pem: cert.pem(),
        der,
    };

    info!(
        subject = %subject.common_name,
        fingerprint = %root.fingerprint,
        validity_days,
        "generated root certificate"
    );

    Ok((root, key))
}

/// Generate a leaf certificate signed by the root.
///
/// `sans` must contain at least one DNS name or IP address. The issued
/// certificate's issuer fields exactly match the root's subject fields, key
/// usage is restricted to digital-signature + key-encipherment, and extended
/// key usage to server authentication.
pub fn generate_leaf_certificate(
    subject: &SubjectInfo,
    sans: &[String],
    root: &RootCertificate,
    root_key: &KeyMaterial,
    validity_days: u32,
) -> Result<(LeafCertificate, KeyMaterial), GenerationError> {
    subject.validate()?;
    let validity = positive_validity(validity_days)?;
    if sans.is_empty() {
        return Err(GenerationError::InvalidInput(
            "at least one DNS name or IP address SAN is required".to_string(),
        ));
    }
    ensure_root_usable(root)?;

    let key = generate_rsa_key(LEAF_KEY_BITS)?;
    let key_pair = key.rcgen_key_pair()?;
    let root_key_pair = root_key.rcgen_key_pair()?;

    // Reconstruct the issuer from the root's DER so the issued certificate's
    // issuer fields are exactly the root's subject fields.
    let root_der = CertificateDer::from(root.der.clone());
    let issuer_params = CertificateParams::from_ca_cert_der(&root_der)
        .map_err(|e| GenerationError::SigningFailed(format!("unusable root certificate: {e}")))?;
    let issuer = issuer_params
        .self_signed(&root_key_pair)
        .map_err(|e| GenerationError::SigningFailed(format!("unusable root key: {e}")))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject.to_distinguished_name();
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.subject_alt_names = parse_sans(sans)?;
    set_validity(&mut params, validity);
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let cert = params
        .signed_by(&key_pair, &issuer, &root_key_pair)
        .map_err(|e| GenerationError::SigningFailed(e.to_string()))?;

    let der = cert.der().to_vec();
    let leaf = LeafCertificate {
        fingerprint: fingerprint(&der),
        pem: cert.pem(),
        der,
    };

    info!(
        subject = %subject.common_name,
        fingerprint = %leaf.fingerprint,
        sans = sans.len(),
        validity_days,
        "generated leaf certificate"
    );

    Ok((leaf, key))
}

/// Check that a certificate's public key matches the given key material.
pub fn key_matches_certificate(
    cert_der: &[u8],
    key: &KeyMaterial,
) -> Result<bool, GenerationError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| GenerationError::InvalidInput(format!("unparseable certificate: {e}")))?;
    let spki = cert.public_key().raw.to_vec();
    Ok(spki == key.public_key_der()?)
}

fn generate_rsa_key(bits: usize) -> Result<KeyMaterial, GenerationError> {
    if bits < 2048 {
        return Err(GenerationError::InvalidInput(format!(
            "RSA keys below 2048 bits are not permitted (requested {bits})"
        )));
    }
    debug!(bits, "generating RSA key pair");
    let key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| GenerationError::KeyGenerationFailed(e.to_string()))?;
    let der = key
        .to_pkcs8_der()
        .map_err(|e| GenerationError::KeyGenerationFailed(e.to_string()))?;
    Ok(KeyMaterial::from_pkcs8_der(der.as_bytes().to_vec()))
}

fn positive_validity(validity_days: u32) -> Result<time::Duration, GenerationError> {
    if validity_days == 0 {
        return Err(GenerationError::InvalidInput(
            "validity period must be positive".to_string(),
        ));
    }
    Ok(time::Duration::days(i64::from(validity_days)))
}

fn set_validity(params: &mut CertificateParams, validity: time::Duration) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + validity;
}

fn ensure_root_usable(root: &RootCertificate) -> Result<(), GenerationError> {
    let (_, cert) = X509Certificate::from_der(&root.der)
        .map_err(|e| GenerationError::SigningFailed(format!("unparseable root: {e}")))?;
    if !cert.validity().is_valid() {
        return Err(GenerationError::SigningFailed(
            "root certificate is expired or not yet valid".to_string(),
        ));
    }
    Ok(())
}

fn parse_sans(sans: &[String]) -> Result<Vec<SanType>, GenerationError> {
    sans.iter()
        .map(|san| {
            if let Ok(ip) = san.parse::<IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.as_str())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        GenerationError::InvalidInput(format!("invalid SAN '{san}': {e}"))
                    })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use x509_parser::extensions::ParsedExtension;

    // RSA generation is the slow part of these tests; share one chain.
    fn test_chain() -> &'static (RootCertificate, KeyMaterial, LeafCertificate, KeyMaterial) {
        static CHAIN: OnceLock<(RootCertificate, KeyMaterial, LeafCertificate, KeyMaterial)> =
            OnceLock::new();
        CHAIN.get_or_init(|| {
            let subject = SubjectInfo::new("Test Root CA").with_organization("Localtrust Tests");
            let (root, root_key) =
                generate_root_certificate_with_bits(&subject, 730, 2048).unwrap();
            let (leaf, leaf_key) = generate_leaf_certificate(
                &SubjectInfo::new("localhost"),
                &["localhost".to_string(), "127.0.0.1".to_string()],
                &root,
                &root_key,
                365,
            )
            .unwrap();
            (root, root_key, leaf, leaf_key)
        })
    }

    #[test]
    fn root_is_self_signed_ca() {
        let (root, _, _, _) = test_chain();
        let (_, cert) = X509Certificate::from_der(&root.der).unwrap();
        assert_eq!(cert.subject(), cert.issuer());
        let bc = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::BasicConstraints(bc) => Some(bc),
                _ => None,
            })
            .expect("basic constraints present");
        assert!(bc.ca);
    }

    #[test]
    fn leaf_issuer_matches_root_subject() {
        let (root, _, leaf, _) = test_chain();
        let (_, root_cert) = X509Certificate::from_der(&root.der).unwrap();
        let (_, leaf_cert) = X509Certificate::from_der(&leaf.der).unwrap();
        assert_eq!(leaf_cert.issuer(), root_cert.subject());
        assert_ne!(leaf_cert.subject(), leaf_cert.issuer());
    }

    #[test]
    fn leaf_key_matches_leaf_certificate() {
        let (root, _, leaf, leaf_key) = test_chain();
        assert!(key_matches_certificate(&leaf.der, leaf_key).unwrap());
        // Wrong certificate for the key
        assert!(!key_matches_certificate(&root.der, leaf_key).unwrap());
    }

    #[test]
    fn fingerprint_is_stable_across_rederivation() {
        let (root, _, leaf, _) = test_chain();
        assert_eq!(crate::fingerprint(&root.der), root.fingerprint);
        assert_eq!(crate::fingerprint(&leaf.der), leaf.fingerprint);
    }

    #[test]
    fn empty_subject_is_rejected() {
        let result = generate_root_certificate_with_bits(&SubjectInfo::new("  "), 730, 2048);
        assert!(matches!(result, Err(GenerationError::InvalidInput(_))));
    }

    #[test]
    fn zero_validity_is_rejected() {
        let result =
            generate_root_certificate_with_bits(&SubjectInfo::new("Test Root CA"), 0, 2048);
        assert!(matches!(result, Err(GenerationError::InvalidInput(_))));
    }

    #[test]
    fn leaf_requires_at_least_one_san() {
        let (root, root_key, _, _) = test_chain();
        let result =
            generate_leaf_certificate(&SubjectInfo::new("localhost"), &[], root, root_key, 365);
        assert!(matches!(result, Err(GenerationError::InvalidInput(_))));
    }

    #[test]
    fn weak_keys_are_rejected() {
        let result =
            generate_root_certificate_with_bits(&SubjectInfo::new("Test Root CA"), 730, 1024);
        assert!(matches!(result, Err(GenerationError::InvalidInput(_))));
    }

    #[test]
    fn pem_output_round_trips() {
        let (root, _, leaf, leaf_key) = test_chain();
        assert!(root.pem.contains("BEGIN CERTIFICATE"));
        assert!(leaf.pem.contains("BEGIN CERTIFICATE"));
        let key_pem = leaf_key.to_pem().unwrap();
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
    }
}
