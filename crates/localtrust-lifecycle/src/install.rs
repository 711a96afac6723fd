//! Install-only: install pre-generated material without regeneration
//!
//! The container-startup path. Material generated elsewhere arrives as a
//! source directory holding root certificate files and an encrypted bundle;
//! this path decrypts the bundle, installs roots and leaf, validates, and
//! records the fingerprint. The bundle is decrypted and its key binding
//! verified before anything is written, so a bad password or corrupted
//! bundle leaves the stores untouched.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use localtrust_chain::validate_with_extras;
use localtrust_keygen::{open_bundle, Password, BUNDLE_EXTENSION};
use localtrust_store::{normalize_fingerprint, IdentityStore, StoreMode, StoreName};

use crate::{advance, io_error, FingerprintReference, LifecycleError, LifecycleState};

/// Configuration for an install-only run.
pub struct InstallConfig {
    /// Directory holding root certificate files (`.pem`, `.crt`, `.der`)
    /// and one or more `.bundle` files.
    pub source_dir: PathBuf,
    /// Which bundle to install. `None` requires the source directory to
    /// hold exactly one bundle.
    pub fingerprint: Option<String>,
    pub password: Password,
    pub reference_path: PathBuf,
}

/// What an install-only run did. Warnings are surfaced to the caller but do
/// not fail the run.
#[derive(Debug)]
pub struct InstallOutcome {
    pub fingerprint: String,
    pub warnings: Vec<String>,
}

/// Install pre-generated material from `config.source_dir`.
pub fn install_only(
    store: &IdentityStore,
    config: InstallConfig,
) -> Result<InstallOutcome, LifecycleError> {
    let mut state = LifecycleState::Uninitialized;
    let mut warnings = Vec::new();

    let bundle_path = resolve_bundle_path(&config.source_dir, config.fingerprint.as_deref())?;
    let bundle_bytes =
        fs::read(&bundle_path).map_err(|e| io_error(&bundle_path, e))?;

    // Everything that can reject the material happens before the first
    // store write: a failure here leaves no partial state behind.
    let bundle = open_bundle(&bundle_bytes, &config.password)?;
    bundle.verify_key_binding()?;
    let fingerprint = bundle.leaf_fingerprint();
    if let Some(stem) = bundle_path.file_stem().and_then(|s| s.to_str()) {
        if normalize_fingerprint(stem) != fingerprint {
            return Err(LifecycleError::InvalidInput(format!(
                "bundle file '{}' does not carry the certificate its name claims",
                bundle_path.display()
            )));
        }
    }
    debug!(bundle = %bundle_path.display(), fingerprint = %fingerprint, "bundle verified");

    let root_handle = store.open(StoreName::RootTrust, StoreMode::ReadWrite)?;
    for (path, der) in collect_root_certificates(&config.source_dir)? {
        let entry = root_handle.install(&der, None)?;
        debug!(
            path = %path.display(),
            fingerprint = %entry.fingerprint,
            "installed root certificate"
        );
    }
    advance(&mut state, LifecycleState::RootInstalled);

    let personal_handle = store.open(StoreName::Personal, StoreMode::ReadWrite)?;
    personal_handle.install(&bundle.leaf_cert_der, Some(&bundle_bytes))?;
    drop(personal_handle);
    advance(&mut state, LifecycleState::LeafInstalled);

    // The bundle's embedded root participates in the walk as an untrusted
    // candidate: the chain can complete even when no root file was shipped.
    let result = validate_with_extras(
        &bundle.leaf_cert_der,
        &root_handle,
        &[bundle.root_cert_der.clone()],
    )?;
    advance(&mut state, LifecycleState::Validated);
    drop(root_handle);

    if !result.valid {
        return Err(LifecycleError::ChainValidationFailure {
            stage: "install",
            statuses: result.status_codes,
        });
    }
    if result.untrusted_root_only() {
        let message = format!(
            "chain for {fingerprint} terminates at a root missing from the trust store"
        );
        warn!("{message}");
        warnings.push(message);
    }

    FingerprintReference::new(&config.reference_path).write(&fingerprint)?;
    advance(&mut state, LifecycleState::Complete);

    info!(fingerprint = %fingerprint, warnings = warnings.len(), "install complete");
    Ok(InstallOutcome {
        fingerprint,
        warnings,
    })
}

/// Find the bundle to install: by fingerprint when given, otherwise the
/// single bundle in the directory.
fn resolve_bundle_path(
    source_dir: &Path,
    fingerprint: Option<&str>,
) -> Result<PathBuf, LifecycleError> {
    if let Some(fingerprint) = fingerprint {
        let fingerprint = normalize_fingerprint(fingerprint);
        let path = source_dir.join(format!("{fingerprint}.{BUNDLE_EXTENSION}"));
        if !path.is_file() {
            return Err(LifecycleError::MissingCertificateFile { path });
        }
        return Ok(path);
    }

    let mut bundles = Vec::new();
    for entry in fs::read_dir(source_dir).map_err(|e| io_error(source_dir, e))? {
        let entry = entry.map_err(|e| io_error(source_dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some(BUNDLE_EXTENSION) {
            bundles.push(path);
        }
    }
    match bundles.len() {
        0 => Err(LifecycleError::MissingCertificateFile {
            path: source_dir.to_path_buf(),
        }),
        1 => Ok(bundles.remove(0)),
        n => Err(LifecycleError::InvalidInput(format!(
            "{n} bundles in {}, pass a fingerprint to choose one",
            source_dir.display()
        ))),
    }
}

/// Gather root certificates shipped alongside the bundle. Files are sniffed
/// rather than matched by extension: PEM first, then raw DER. Only
/// self-signed certificates qualify; a leaf PEM or a key file sitting in the
/// same directory must not end up in the trust store.
fn collect_root_certificates(
    source_dir: &Path,
) -> Result<Vec<(PathBuf, Vec<u8>)>, LifecycleError> {
    let mut roots = Vec::new();
    for entry in fs::read_dir(source_dir).map_err(|e| io_error(source_dir, e))? {
        let entry = entry.map_err(|e| io_error(source_dir, e))?;
        let path = entry.path();
        if !path.is_file()
            || path.extension().and_then(|s| s.to_str()) == Some(BUNDLE_EXTENSION)
        {
            continue;
        }
        let bytes = fs::read(&path).map_err(|e| io_error(&path, e))?;
        for der in certificates_in(&bytes) {
            if is_self_signed(&der) {
                roots.push((path.clone(), der));
            } else {
                debug!(path = %path.display(), "skipping non-root certificate");
            }
        }
    }
    Ok(roots)
}

/// Certificates contained in a file: all PEM blocks, or the whole file as
/// DER. Anything else (keys, passwords, notes) yields nothing.
fn certificates_in(bytes: &[u8]) -> Vec<Vec<u8>> {
    let pem: Vec<Vec<u8>> = rustls_pemfile::certs(&mut &bytes[..])
        .filter_map(|c| c.ok())
        .map(|c| c.to_vec())
        .collect();
    if !pem.is_empty() {
        return pem;
    }
    if parses_as_certificate(bytes) {
        return vec![bytes.to_vec()];
    }
    Vec::new()
}

fn parses_as_certificate(der: &[u8]) -> bool {
    use x509_parser::prelude::FromDer;
    x509_parser::certificate::X509Certificate::from_der(der).is_ok()
}

fn is_self_signed(der: &[u8]) -> bool {
    use x509_parser::prelude::FromDer;
    x509_parser::certificate::X509Certificate::from_der(der)
        .map(|(_, cert)| cert.subject() == cert.issuer())
        .unwrap_or(false)
}
