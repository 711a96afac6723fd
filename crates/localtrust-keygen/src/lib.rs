//! Key material generation for the localtrust PKI chain
//!
//! Produces RSA key pairs and X.509 certificates (self-signed root CA,
//! CA-signed leaf) and packages leaf key material into password-protected
//! bundles for transport into the identity store.

pub mod bundle;
pub mod generator;

pub use bundle::{
    bundle_private_key, open_bundle, DecryptedBundle, EncryptedPrivateKeyBundle, Password,
    BUNDLE_EXTENSION, MIN_PASSWORD_LEN,
};
pub use generator::{
    generate_leaf_certificate, generate_root_certificate, generate_root_certificate_with_bits,
    KeyMaterial, LeafCertificate, RootCertificate, SubjectInfo, DEFAULT_LEAF_VALIDITY_DAYS,
    DEFAULT_ROOT_VALIDITY_DAYS, LEAF_KEY_BITS, ROOT_KEY_BITS,
};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Key material and certificate generation errors
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("password policy violation: {0}")]
    PasswordPolicy(String),

    #[error("bundle encryption failed: {0}")]
    Encryption(String),

    #[error("bundle decryption failed: {0}")]
    Decryption(String),
}

/// Compute the stable fingerprint of a certificate: SHA-256 over the DER
/// encoding, uppercase hex, no separators.
///
/// The same DER bytes always produce the same fingerprint, so a fingerprint
/// recorded at generation time can be re-derived from a re-read store entry.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(der))
}
