//! Server identity resolution for the TLS runtime
//!
//! The server asks for its identity by fingerprint. The happy path loads the
//! leaf and its bundle from the personal store; every miss (no store, no
//! entry, no bundle, wrong password) degrades to a freshly generated
//! ephemeral certificate, so the server always comes up.

use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info, warn};

use localtrust_keygen::{open_bundle, Password};
use localtrust_store::{IdentityStore, StoreMode, StoreName};

use crate::LifecycleError;

const FALLBACK_COMMON_NAME: &str = "Localtrust Fallback Certificate";
const FALLBACK_VALIDITY_DAYS: i64 = 90;

/// Which identity-store scope to resolve against. Stores are per-user; a
/// machine-wide scope is deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreScope {
    #[default]
    CurrentUser,
}

/// Where a resolved identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerIdentitySource {
    Store,
    EphemeralFallback,
}

/// Identity configuration, validated at construction so a typo in the
/// fingerprint or a wrong store name fails at startup rather than at first
/// resolution.
#[derive(Debug, Clone)]
pub struct TlsIdentityConfig {
    fingerprint: String,
    store_name: StoreName,
    scope: StoreScope,
}

impl TlsIdentityConfig {
    pub fn new(
        fingerprint: impl Into<String>,
        store_name: StoreName,
        scope: StoreScope,
    ) -> Result<Self, LifecycleError> {
        let fingerprint = fingerprint.into();
        if fingerprint.len() != 64 || !fingerprint.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(LifecycleError::InvalidInput(format!(
                "'{fingerprint}' is not a 64-character hex SHA-256 fingerprint"
            )));
        }
        // Server identities carry private keys; only the personal store
        // holds those.
        if store_name != StoreName::Personal {
            return Err(LifecycleError::InvalidInput(format!(
                "server identities are resolved from the '{}' store, not '{store_name}'",
                StoreName::Personal
            )));
        }
        Ok(Self {
            fingerprint: fingerprint.to_uppercase(),
            store_name,
            scope,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn store_name(&self) -> StoreName {
        self.store_name
    }

    pub fn scope(&self) -> StoreScope {
        self.scope
    }
}

/// A resolved server identity, ready for a TLS stack.
pub struct ServerIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub source: ServerIdentitySource,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Resolve the configured identity, falling back to an ephemeral one.
///
/// Only the fallback generation itself can fail; store and bundle problems
/// are logged and absorbed.
pub fn resolve_server_identity(
    store: &IdentityStore,
    config: &TlsIdentityConfig,
    password: &Password,
) -> Result<ServerIdentity, LifecycleError> {
    match load_from_store(store, config, password) {
        Ok(identity) => {
            info!(
                fingerprint = %config.fingerprint(),
                "resolved server identity from the personal store"
            );
            Ok(identity)
        }
        Err(reason) => {
            warn!(
                fingerprint = %config.fingerprint(),
                reason = %reason,
                "falling back to an ephemeral server identity"
            );
            generate_ephemeral_identity()
        }
    }
}

fn load_from_store(
    store: &IdentityStore,
    config: &TlsIdentityConfig,
    password: &Password,
) -> Result<ServerIdentity, String> {
    let handle = store
        .open(config.store_name(), StoreMode::ReadOnly)
        .map_err(|e| e.to_string())?;
    let entry = handle
        .find_by_fingerprint(config.fingerprint())
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "no entry for the configured fingerprint".to_string())?;
    if !entry.is_currently_valid() {
        return Err("installed certificate is outside its validity window".to_string());
    }
    let bundle_bytes = handle
        .bundle_bytes(&entry.fingerprint)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "entry has no private-key bundle".to_string())?;
    let bundle = open_bundle(&bundle_bytes, password).map_err(|e| e.to_string())?;

    debug!(
        fingerprint = %entry.fingerprint,
        days_until_expiry = entry.days_until_expiry(),
        "loaded identity bundle"
    );

    Ok(ServerIdentity {
        cert_chain: vec![
            CertificateDer::from(bundle.leaf_cert_der.clone()),
            CertificateDer::from(bundle.root_cert_der.clone()),
        ],
        private_key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            bundle.leaf_key.pkcs8_der().to_vec(),
        )),
        source: ServerIdentitySource::Store,
    })
}

/// Generate a short-lived self-signed identity for localhost.
pub fn generate_ephemeral_identity() -> Result<ServerIdentity, LifecycleError> {
    let key = rcgen::KeyPair::generate()
        .map_err(|e| LifecycleError::InvalidInput(format!("ephemeral key generation: {e}")))?;

    let mut params = rcgen::CertificateParams::default();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, FALLBACK_COMMON_NAME);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(
            rcgen::Ia5String::try_from("localhost")
                .map_err(|e| LifecycleError::InvalidInput(e.to_string()))?,
        ),
        rcgen::SanType::IpAddress("127.0.0.1".parse().map_err(
            |e: std::net::AddrParseError| LifecycleError::InvalidInput(e.to_string()),
        )?),
        rcgen::SanType::IpAddress(
            "::1".parse()
                .map_err(|e: std::net::AddrParseError| LifecycleError::InvalidInput(e.to_string()))?,
        ),
    ];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(FALLBACK_VALIDITY_DAYS);
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let cert = params
        .self_signed(&key)
        .map_err(|e| LifecycleError::InvalidInput(format!("ephemeral certificate: {e}")))?;

    Ok(ServerIdentity {
        cert_chain: vec![cert.der().clone()],
        private_key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        source: ServerIdentitySource::EphemeralFallback,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use localtrust_store::StoreLocationConfig;
    use tempfile::TempDir;

    fn config() -> TlsIdentityConfig {
        TlsIdentityConfig::new("AB".repeat(32), StoreName::Personal, StoreScope::CurrentUser)
            .unwrap()
    }

    #[test]
    fn malformed_fingerprints_are_rejected_at_construction() {
        assert!(
            TlsIdentityConfig::new("not-hex", StoreName::Personal, StoreScope::CurrentUser)
                .is_err()
        );
        assert!(TlsIdentityConfig::new(
            "AB:CD".repeat(16),
            StoreName::Personal,
            StoreScope::CurrentUser
        )
        .is_err());
        assert!(TlsIdentityConfig::new(
            "ab".repeat(32),
            StoreName::Personal,
            StoreScope::CurrentUser
        )
        .is_ok());
    }

    #[test]
    fn identities_only_resolve_from_the_personal_store() {
        assert!(TlsIdentityConfig::new(
            "AB".repeat(32),
            StoreName::RootTrust,
            StoreScope::CurrentUser
        )
        .is_err());
    }

    #[test]
    fn fingerprints_are_stored_uppercase() {
        let config =
            TlsIdentityConfig::new("ab".repeat(32), StoreName::Personal, StoreScope::CurrentUser)
                .unwrap();
        assert_eq!(config.fingerprint(), "AB".repeat(32));
    }

    #[test]
    fn missing_store_degrades_to_ephemeral() {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(StoreLocationConfig::with_base_dir(dir.path()));
        let password = Password::new("a-perfectly-fine-password").unwrap();

        let identity = resolve_server_identity(&store, &config(), &password).unwrap();
        assert_eq!(identity.source, ServerIdentitySource::EphemeralFallback);
        assert_eq!(identity.cert_chain.len(), 1);
    }

    #[test]
    fn ephemeral_identity_is_accepted_by_rustls() {
        let identity = generate_ephemeral_identity().unwrap();
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain, identity.private_key)
            .unwrap();
    }

    #[test]
    fn identity_debug_does_not_expose_key_material() {
        let identity = generate_ephemeral_identity().unwrap();
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("EphemeralFallback"));
        assert!(!rendered.contains("private_key"));
    }
}
