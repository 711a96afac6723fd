//! Full setup: generate, persist, install, validate
//!
//! The operator-invoked path. Generates a fresh root CA and leaf certificate,
//! writes the artifact directory, installs both certificates into their
//! stores, validates the resulting chain, and records the leaf fingerprint.
//! The fingerprint reference is written only after validation succeeds.

use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use localtrust_chain::{validate, ChainStatus};
use localtrust_keygen::{
    bundle_private_key, generate_leaf_certificate, generate_root_certificate_with_bits, Password,
    SubjectInfo, DEFAULT_LEAF_VALIDITY_DAYS, DEFAULT_ROOT_VALIDITY_DAYS, ROOT_KEY_BITS,
};
use localtrust_store::{IdentityStore, StoreMode, StoreName};

use crate::{
    advance, artifacts::SetupArtifacts, reference::FingerprintReference, LifecycleError,
    LifecycleState,
};

/// Configuration for a full setup run.
pub struct SetupConfig {
    pub root_subject: SubjectInfo,
    pub leaf_subject: SubjectInfo,
    pub sans: Vec<String>,
    pub root_validity_days: u32,
    pub leaf_validity_days: u32,
    pub root_key_bits: usize,
    pub output_dir: PathBuf,
    pub reference_path: PathBuf,
    /// Bundle password. `None` generates one and, when
    /// `write_password_file` is set, leaves it in the artifact directory.
    pub password: Option<Password>,
    /// Write the generated password to `bundle-password.txt` (0600). Meant
    /// for development machines where the artifacts never leave the host.
    pub write_password_file: bool,
    /// Remove same-subject roots from the trust store before installing the
    /// new one, so rotations do not accumulate stale anchors.
    pub cleanup_existing_roots: bool,
    /// Regenerate even when a valid installed identity already exists.
    pub force: bool,
}

impl SetupConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            root_subject: SubjectInfo::new("Localtrust Development CA")
                .with_organization("Localtrust"),
            leaf_subject: SubjectInfo::new("localhost"),
            sans: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "::1".to_string(),
            ],
            root_validity_days: DEFAULT_ROOT_VALIDITY_DAYS,
            leaf_validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
            root_key_bits: ROOT_KEY_BITS,
            output_dir: base_dir.join("generated"),
            reference_path: base_dir.join("active-fingerprint"),
            password: None,
            write_password_file: true,
            cleanup_existing_roots: true,
            force: false,
        }
    }
}

/// What a full setup run did.
#[derive(Debug)]
pub enum SetupOutcome {
    /// A valid identity was already installed; nothing was regenerated.
    AlreadySatisfied { fingerprint: String },
    Completed {
        root_fingerprint: String,
        leaf_fingerprint: String,
        password_generated: bool,
    },
}

/// Run the full generate-install-validate sequence.
pub fn full_setup(
    store: &IdentityStore,
    config: SetupConfig,
) -> Result<SetupOutcome, LifecycleError> {
    let mut state = LifecycleState::Uninitialized;
    let reference = FingerprintReference::new(&config.reference_path);

    if !config.force {
        if let Some(fingerprint) = existing_valid_identity(store, &reference)? {
            info!(fingerprint = %fingerprint, "installed identity is still valid, skipping setup");
            return Ok(SetupOutcome::AlreadySatisfied { fingerprint });
        }
    }

    let (root, root_key) = generate_root_certificate_with_bits(
        &config.root_subject,
        config.root_validity_days,
        config.root_key_bits,
    )?;
    advance(&mut state, LifecycleState::RootGenerated);

    let (leaf, leaf_key) = generate_leaf_certificate(
        &config.leaf_subject,
        &config.sans,
        &root,
        &root_key,
        config.leaf_validity_days,
    )?;
    advance(&mut state, LifecycleState::LeafGenerated);

    let password_generated = config.password.is_none();
    let password = match config.password {
        Some(password) => password,
        None => Password::generate(),
    };
    let bundle = bundle_private_key(&leaf, &leaf_key, &root, &password)?;
    advance(&mut state, LifecycleState::Bundled);

    let artifacts = SetupArtifacts::new(&config.output_dir);
    artifacts.write_public(&artifacts.root_cert_path(), root.pem.as_bytes())?;
    artifacts.write_secret(&artifacts.root_key_path(), root_key.to_pem()?.as_bytes())?;
    artifacts.write_public(&artifacts.leaf_cert_path(), leaf.pem.as_bytes())?;
    artifacts.write_secret(&artifacts.leaf_key_path(), leaf_key.to_pem()?.as_bytes())?;
    artifacts.write_secret(&artifacts.bundle_path(&leaf.fingerprint), bundle.as_bytes())?;
    if password_generated && config.write_password_file {
        artifacts.write_secret(&artifacts.password_path(), password.expose().as_bytes())?;
        warn!(
            path = %artifacts.password_path().display(),
            "bundle password written to disk, restrict access to the artifact directory"
        );
    }

    let root_handle = store.open(StoreName::RootTrust, StoreMode::ReadWrite)?;
    if config.cleanup_existing_roots {
        let removed = root_handle.remove_by_subject_pattern(&config.root_subject.common_name)?;
        if removed > 0 {
            debug!(removed, "removed stale roots before install");
        }
    }
    root_handle.install(&root.der, None)?;
    advance(&mut state, LifecycleState::RootInstalled);

    let personal_handle = store.open(StoreName::Personal, StoreMode::ReadWrite)?;
    personal_handle.install(&leaf.der, Some(bundle.as_bytes()))?;
    drop(personal_handle);
    advance(&mut state, LifecycleState::LeafInstalled);

    let result = validate(&leaf.der, &root_handle)?;
    advance(&mut state, LifecycleState::Validated);
    if result.status_codes != BTreeSet::from([ChainStatus::Valid]) {
        return Err(LifecycleError::ChainValidationFailure {
            stage: "full setup",
            statuses: result.status_codes,
        });
    }
    drop(root_handle);

    reference.write(&leaf.fingerprint)?;
    advance(&mut state, LifecycleState::Complete);

    info!(
        root = %root.fingerprint,
        leaf = %leaf.fingerprint,
        "full setup complete"
    );
    Ok(SetupOutcome::Completed {
        root_fingerprint: root.fingerprint,
        leaf_fingerprint: leaf.fingerprint,
        password_generated,
    })
}

/// Check whether the referenced identity is installed and inside its
/// validity window. Any failure along the way means setup has to run.
fn existing_valid_identity(
    store: &IdentityStore,
    reference: &FingerprintReference,
) -> Result<Option<String>, LifecycleError> {
    let Some(fingerprint) = reference.read()? else {
        return Ok(None);
    };
    let Ok(handle) = store.open(StoreName::Personal, StoreMode::ReadOnly) else {
        return Ok(None);
    };
    match handle.find_by_fingerprint(&fingerprint)? {
        Some(entry) if entry.is_currently_valid() => Ok(Some(fingerprint)),
        Some(_) => {
            debug!(fingerprint = %fingerprint, "installed identity is outside its validity window");
            Ok(None)
        }
        None => Ok(None),
    }
}
