//! Password-protected private-key bundles
//!
//! A bundle binds a leaf certificate to its private key plus the root
//! certificate for chain completeness, encrypted under a password with
//! PBKDF2-HMAC-SHA256 key derivation and AES-256-GCM. Created once at
//! generation time, consumed at install time.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::generator::{KeyMaterial, LeafCertificate, RootCertificate};
use crate::{fingerprint, GenerationError};

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 16;
/// File extension used for bundles on disk (`<fingerprint>.bundle`).
pub const BUNDLE_EXTENSION: &str = "bundle";

const BUNDLE_VERSION: u32 = 1;
const KDF_NAME: &str = "pbkdf2-hmac-sha256";
const PBKDF2_ITERATIONS: u32 = 210_000;
const GENERATED_PASSWORD_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// A bundle password: process-transient, zeroized on drop, never logged.
pub struct Password(Zeroizing<String>);

impl Password {
    /// Accept a user-supplied password, enforcing the minimum length policy.
    pub fn new(password: impl Into<String>) -> Result<Self, GenerationError> {
        let password = Zeroizing::new(password.into());
        if password.len() < MIN_PASSWORD_LEN {
            return Err(GenerationError::PasswordPolicy(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        Ok(Self(password))
    }

    /// Generate a random alphanumeric password from the OS CSPRNG.
    pub fn generate() -> Self {
        let password: String = (&mut OsRng)
            .sample_iter(&Alphanumeric)
            .take(GENERATED_PASSWORD_LEN)
            .map(char::from)
            .collect();
        Self(Zeroizing::new(password))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

/// On-disk bundle envelope. Every binary field is base64.
#[derive(Serialize, Deserialize)]
struct BundleEnvelope {
    version: u32,
    kdf: String,
    iterations: u32,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Plaintext bundle payload, zeroized after use.
#[derive(Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
struct BundlePayload {
    leaf_cert_pem: String,
    leaf_key_pem: String,
    root_cert_pem: String,
}

/// An encrypted private-key bundle keyed by the leaf fingerprint.
pub struct EncryptedPrivateKeyBundle {
    bytes: Vec<u8>,
    fingerprint: String,
}

impl EncryptedPrivateKeyBundle {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The fingerprint of the leaf certificate this bundle carries.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Canonical file name for this bundle: `<fingerprint>.bundle`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.fingerprint, BUNDLE_EXTENSION)
    }
}

/// Encrypt the leaf key together with the leaf and root certificates.
pub fn bundle_private_key(
    leaf: &LeafCertificate,
    leaf_key: &KeyMaterial,
    root: &RootCertificate,
    password: &Password,
) -> Result<EncryptedPrivateKeyBundle, GenerationError> {
    let payload = BundlePayload {
        leaf_cert_pem: leaf.pem.clone(),
        leaf_key_pem: leaf_key.to_pem()?.to_string(),
        root_cert_pem: root.pem.clone(),
    };
    let plaintext = Zeroizing::new(
        serde_json::to_vec(&payload).map_err(|e| GenerationError::Encryption(e.to_string()))?,
    );

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, PBKDF2_ITERATIONS);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| GenerationError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|e| GenerationError::Encryption(e.to_string()))?;

    let envelope = BundleEnvelope {
        version: BUNDLE_VERSION,
        kdf: KDF_NAME.to_string(),
        iterations: PBKDF2_ITERATIONS,
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(&ciphertext),
    };
    let bytes = serde_json::to_vec_pretty(&envelope)
        .map_err(|e| GenerationError::Encryption(e.to_string()))?;

    debug!(fingerprint = %leaf.fingerprint, "sealed private-key bundle");

    Ok(EncryptedPrivateKeyBundle {
        bytes,
        fingerprint: leaf.fingerprint.clone(),
    })
}

/// The decrypted contents of a bundle.
pub struct DecryptedBundle {
    pub leaf_cert_der: Vec<u8>,
    pub leaf_key: KeyMaterial,
    pub root_cert_der: Vec<u8>,
}

impl DecryptedBundle {
    /// The fingerprint of the carried leaf certificate.
    pub fn leaf_fingerprint(&self) -> String {
        fingerprint(&self.leaf_cert_der)
    }

    /// Check that the carried key belongs to the carried leaf certificate.
    pub fn verify_key_binding(&self) -> Result<(), GenerationError> {
        if crate::generator::key_matches_certificate(&self.leaf_cert_der, &self.leaf_key)? {
            Ok(())
        } else {
            Err(GenerationError::InvalidInput(
                "bundle private key does not match the leaf certificate".to_string(),
            ))
        }
    }
}

/// Decrypt a bundle produced by [`bundle_private_key`].
pub fn open_bundle(
    bytes: &[u8],
    password: &Password,
) -> Result<DecryptedBundle, GenerationError> {
    let envelope: BundleEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| GenerationError::Decryption(format!("malformed bundle envelope: {e}")))?;
    if envelope.version != BUNDLE_VERSION {
        return Err(GenerationError::Decryption(format!(
            "unsupported bundle version {}",
            envelope.version
        )));
    }
    if envelope.kdf != KDF_NAME {
        return Err(GenerationError::Decryption(format!(
            "unsupported key derivation '{}'",
            envelope.kdf
        )));
    }

    let salt = decode_field(&envelope.salt, "salt")?;
    let nonce = decode_field(&envelope.nonce, "nonce")?;
    let ciphertext = decode_field(&envelope.ciphertext, "ciphertext")?;
    if nonce.len() != NONCE_LEN {
        return Err(GenerationError::Decryption(
            "malformed bundle nonce".to_string(),
        ));
    }

    let key = derive_key(password, &salt, envelope.iterations);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| GenerationError::Decryption(e.to_string()))?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| {
                GenerationError::Decryption(
                    "bundle decryption failed (wrong password or corrupted bundle)".to_string(),
                )
            })?,
    );

    let payload: BundlePayload = serde_json::from_slice(&plaintext)
        .map_err(|e| GenerationError::Decryption(format!("malformed bundle payload: {e}")))?;

    let leaf_cert_der = single_cert_der(&payload.leaf_cert_pem, "leaf certificate")?;
    let root_cert_der = single_cert_der(&payload.root_cert_pem, "root certificate")?;
    let leaf_key = private_key_der(&payload.leaf_key_pem)?;

    Ok(DecryptedBundle {
        leaf_cert_der,
        leaf_key,
        root_cert_der,
    })
}

fn derive_key(password: &Password, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(
        password.expose().as_bytes(),
        salt,
        iterations,
        key.as_mut_slice(),
    );
    key
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>, GenerationError> {
    BASE64
        .decode(value)
        .map_err(|e| GenerationError::Decryption(format!("malformed bundle {field}: {e}")))
}

fn single_cert_der(pem: &str, what: &str) -> Result<Vec<u8>, GenerationError> {
    let mut certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GenerationError::Decryption(format!("unparseable {what}: {e}")))?;
    match certs.len() {
        1 => Ok(certs.remove(0).to_vec()),
        n => Err(GenerationError::Decryption(format!(
            "expected exactly one {what} in bundle, found {n}"
        ))),
    }
}

fn private_key_der(pem: &str) -> Result<KeyMaterial, GenerationError> {
    use rustls_pki_types::PrivateKeyDer;

    let key = rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| GenerationError::Decryption(format!("unparseable private key: {e}")))?
        .ok_or_else(|| GenerationError::Decryption("bundle carries no private key".to_string()))?;
    match key {
        PrivateKeyDer::Pkcs8(der) => Ok(KeyMaterial::from_pkcs8_der(der.secret_pkcs8_der().to_vec())),
        _ => Err(GenerationError::Decryption(
            "bundle private key is not PKCS#8".to_string(),
        )),
    }
}
