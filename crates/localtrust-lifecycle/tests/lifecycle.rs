//! End-to-end lifecycle tests: full setup, install-only, and the TLS
//! identity surface, all against temporary store directories.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tempfile::TempDir;

use localtrust_keygen::Password;
use localtrust_lifecycle::{
    full_setup, install_only, resolve_server_identity, FingerprintReference, InstallConfig,
    LifecycleError, ServerIdentitySource, SetupConfig, SetupOutcome, StoreScope, TlsIdentityConfig,
};
use localtrust_store::{IdentityStore, StoreLocationConfig, StoreMode, StoreName};

const TEST_PASSWORD: &str = "a-perfectly-fine-password";

fn store_at(base: &Path) -> IdentityStore {
    IdentityStore::new(StoreLocationConfig::with_base_dir(base))
}

fn test_setup_config(base: &Path) -> SetupConfig {
    let mut config = SetupConfig::new(base);
    // 4096-bit roots are too slow for a test loop.
    config.root_key_bits = 2048;
    config.password = Some(Password::new(TEST_PASSWORD).unwrap());
    config
}

/// Setup is the slow part (RSA key generation); run it once and share the
/// resulting artifact directory between tests that only consume it.
struct SetupFixture {
    _base: TempDir,
    store: IdentityStore,
    root_fingerprint: String,
    leaf_fingerprint: String,
    output_dir: std::path::PathBuf,
    reference_path: std::path::PathBuf,
}

fn setup_fixture() -> &'static SetupFixture {
    static FIXTURE: OnceLock<SetupFixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let base = TempDir::new().unwrap();
        let store = store_at(base.path());
        let config = test_setup_config(base.path());
        let output_dir = config.output_dir.clone();
        let reference_path = config.reference_path.clone();

        let outcome = full_setup(&store, config).unwrap();
        let SetupOutcome::Completed {
            root_fingerprint,
            leaf_fingerprint,
            ..
        } = outcome
        else {
            panic!("fresh setup must complete, got {outcome:?}");
        };
        SetupFixture {
            _base: base,
            store,
            root_fingerprint,
            leaf_fingerprint,
            output_dir,
            reference_path,
        }
    })
}

#[test]
fn full_setup_installs_both_certificates_and_records_the_fingerprint() {
    let f = setup_fixture();

    let root_handle = f
        .store
        .open(StoreName::RootTrust, StoreMode::ReadOnly)
        .unwrap();
    let root_entry = root_handle
        .find_by_fingerprint(&f.root_fingerprint)
        .unwrap()
        .unwrap();
    assert!(root_entry.is_ca);
    assert!(root_entry.is_self_signed());

    let personal_handle = f
        .store
        .open(StoreName::Personal, StoreMode::ReadOnly)
        .unwrap();
    let leaf_entry = personal_handle
        .find_by_fingerprint(&f.leaf_fingerprint)
        .unwrap()
        .unwrap();
    assert!(!leaf_entry.is_ca);
    assert!(leaf_entry.has_bundle);

    let reference = FingerprintReference::new(&f.reference_path);
    assert_eq!(reference.read().unwrap(), Some(f.leaf_fingerprint.clone()));
}

#[test]
fn full_setup_writes_the_artifact_directory() {
    let f = setup_fixture();
    assert!(f.output_dir.join("root_cert.pem").is_file());
    assert!(f.output_dir.join("root_key.pem").is_file());
    assert!(f.output_dir.join("leaf_cert.pem").is_file());
    assert!(f.output_dir.join("leaf_key.pem").is_file());
    assert!(f
        .output_dir
        .join(format!("{}.bundle", f.leaf_fingerprint))
        .is_file());
    // The password was supplied, not generated, so no password file.
    assert!(!f.output_dir.join("bundle-password.txt").exists());
}

#[test]
fn rerun_without_force_is_satisfied_by_the_installed_identity() {
    let f = setup_fixture();
    let config = test_setup_config(f._base.path());
    match full_setup(&f.store, config).unwrap() {
        SetupOutcome::AlreadySatisfied { fingerprint } => {
            assert_eq!(fingerprint, f.leaf_fingerprint);
        }
        other => panic!("expected AlreadySatisfied, got {other:?}"),
    }
}

#[test]
fn resolved_identity_comes_from_the_store_and_loads_into_rustls() {
    let f = setup_fixture();
    let config = TlsIdentityConfig::new(
        f.leaf_fingerprint.clone(),
        StoreName::Personal,
        StoreScope::CurrentUser,
    )
    .unwrap();
    let password = Password::new(TEST_PASSWORD).unwrap();

    let identity = resolve_server_identity(&f.store, &config, &password).unwrap();
    assert_eq!(identity.source, ServerIdentitySource::Store);
    assert_eq!(identity.cert_chain.len(), 2);

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain, identity.private_key)
        .unwrap();
}

#[test]
fn wrong_bundle_password_degrades_to_an_ephemeral_identity() {
    let f = setup_fixture();
    let config = TlsIdentityConfig::new(
        f.leaf_fingerprint.clone(),
        StoreName::Personal,
        StoreScope::CurrentUser,
    )
    .unwrap();
    let wrong = Password::new("an-entirely-wrong-password").unwrap();

    let identity = resolve_server_identity(&f.store, &config, &wrong).unwrap();
    assert_eq!(identity.source, ServerIdentitySource::EphemeralFallback);
}

#[test]
fn install_only_with_shipped_root_is_warning_free() {
    let f = setup_fixture();
    let target = TempDir::new().unwrap();
    let store = store_at(target.path());

    let outcome = install_only(
        &store,
        InstallConfig {
            source_dir: f.output_dir.clone(),
            fingerprint: None,
            password: Password::new(TEST_PASSWORD).unwrap(),
            reference_path: target.path().join("active-fingerprint"),
        },
    )
    .unwrap();

    assert_eq!(outcome.fingerprint, f.leaf_fingerprint);
    assert!(outcome.warnings.is_empty());

    let root_handle = store.open(StoreName::RootTrust, StoreMode::ReadOnly).unwrap();
    assert!(root_handle
        .find_by_fingerprint(&f.root_fingerprint)
        .unwrap()
        .is_some());
    let personal_handle = store.open(StoreName::Personal, StoreMode::ReadOnly).unwrap();
    let entry = personal_handle
        .find_by_fingerprint(&f.leaf_fingerprint)
        .unwrap()
        .unwrap();
    assert!(entry.has_bundle);
}

#[test]
fn install_only_without_root_file_warns_about_the_untrusted_root() {
    let f = setup_fixture();
    let target = TempDir::new().unwrap();
    let store = store_at(target.path());

    // Ship only the bundle: the chain completes through the embedded root
    // but the trust store never sees it.
    let source = TempDir::new().unwrap();
    let bundle_name = format!("{}.bundle", f.leaf_fingerprint);
    fs::copy(
        f.output_dir.join(&bundle_name),
        source.path().join(&bundle_name),
    )
    .unwrap();

    let outcome = install_only(
        &store,
        InstallConfig {
            source_dir: source.path().to_path_buf(),
            fingerprint: None,
            password: Password::new(TEST_PASSWORD).unwrap(),
            reference_path: target.path().join("active-fingerprint"),
        },
    )
    .unwrap();

    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("trust store"));
}

#[test]
fn install_only_rejects_a_wrong_password_before_touching_the_stores() {
    let f = setup_fixture();
    let target = TempDir::new().unwrap();
    let store = store_at(target.path());

    let result = install_only(
        &store,
        InstallConfig {
            source_dir: f.output_dir.clone(),
            fingerprint: None,
            password: Password::new("an-entirely-wrong-password").unwrap(),
            reference_path: target.path().join("active-fingerprint"),
        },
    );

    assert!(matches!(result, Err(LifecycleError::Generation(_))));
    // No partial state: neither store directory was created.
    assert!(!target.path().join("stores/root-trust").exists());
    assert!(!target.path().join("stores/personal").exists());
    assert!(!target.path().join("active-fingerprint").exists());
}

#[test]
fn install_only_reports_a_missing_bundle() {
    let target = TempDir::new().unwrap();
    let store = store_at(target.path());
    let empty = TempDir::new().unwrap();

    let result = install_only(
        &store,
        InstallConfig {
            source_dir: empty.path().to_path_buf(),
            fingerprint: None,
            password: Password::new(TEST_PASSWORD).unwrap(),
            reference_path: target.path().join("active-fingerprint"),
        },
    );
    assert!(matches!(
        result,
        Err(LifecycleError::MissingCertificateFile { .. })
    ));

    let result = install_only(
        &store,
        InstallConfig {
            source_dir: empty.path().to_path_buf(),
            fingerprint: Some("AB".repeat(32)),
            password: Password::new(TEST_PASSWORD).unwrap(),
            reference_path: target.path().join("active-fingerprint"),
        },
    );
    assert!(matches!(
        result,
        Err(LifecycleError::MissingCertificateFile { .. })
    ));
}

#[test]
fn reinstall_over_the_same_material_is_idempotent() {
    let f = setup_fixture();
    let target = TempDir::new().unwrap();
    let store = store_at(target.path());
    let reference_path = target.path().join("active-fingerprint");

    for _ in 0..2 {
        let outcome = install_only(
            &store,
            InstallConfig {
                source_dir: f.output_dir.clone(),
                fingerprint: Some(f.leaf_fingerprint.clone()),
                password: Password::new(TEST_PASSWORD).unwrap(),
                reference_path: reference_path.clone(),
            },
        )
        .unwrap();
        assert_eq!(outcome.fingerprint, f.leaf_fingerprint);
    }

    let personal_handle = store.open(StoreName::Personal, StoreMode::ReadOnly).unwrap();
    let entries: Vec<_> = personal_handle.list(None).collect::<Result<_, _>>().unwrap();
    assert_eq!(entries.len(), 1);
}
