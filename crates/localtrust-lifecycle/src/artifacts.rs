//! Setup output artifacts
//!
//! Full setup leaves the generated material on disk for inspection and for
//! later install-only runs: certificates world-readable, key material and
//! bundles owner-only. An existing artifact is moved to `<name>.bak` before
//! being replaced, so a rotation never destroys the previous generation.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use localtrust_keygen::BUNDLE_EXTENSION;

use crate::{io_error, LifecycleError};

const ROOT_CERT_FILE: &str = "root_cert.pem";
const ROOT_KEY_FILE: &str = "root_key.pem";
const LEAF_CERT_FILE: &str = "leaf_cert.pem";
const LEAF_KEY_FILE: &str = "leaf_key.pem";
const PASSWORD_FILE: &str = "bundle-password.txt";

/// The artifact directory written by full setup.
#[derive(Debug, Clone)]
pub struct SetupArtifacts {
    dir: PathBuf,
}

impl SetupArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root_cert_path(&self) -> PathBuf {
        self.dir.join(ROOT_CERT_FILE)
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.dir.join(ROOT_KEY_FILE)
    }

    pub fn leaf_cert_path(&self) -> PathBuf {
        self.dir.join(LEAF_CERT_FILE)
    }

    pub fn leaf_key_path(&self) -> PathBuf {
        self.dir.join(LEAF_KEY_FILE)
    }

    pub fn bundle_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.{BUNDLE_EXTENSION}"))
    }

    pub fn password_path(&self) -> PathBuf {
        self.dir.join(PASSWORD_FILE)
    }

    /// Write a world-readable artifact (certificates).
    pub fn write_public(&self, path: &Path, bytes: &[u8]) -> Result<(), LifecycleError> {
        self.write_with_mode(path, bytes, 0o644)
    }

    /// Write an owner-only artifact (keys, bundles, passwords).
    pub fn write_secret(&self, path: &Path, bytes: &[u8]) -> Result<(), LifecycleError> {
        self.write_with_mode(path, bytes, 0o600)
    }

    fn write_with_mode(&self, path: &Path, bytes: &[u8], mode: u32) -> Result<(), LifecycleError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        if path.exists() {
            let backup = backup_path(path);
            fs::rename(path, &backup).map_err(|e| io_error(path, e))?;
            info!(
                path = %path.display(),
                backup = %backup.display(),
                "backed up existing artifact"
            );
        }
        fs::write(path, bytes).map_err(|e| io_error(path, e))?;
        set_mode(path, mode)?;
        debug!(path = %path.display(), mode = format_args!("{mode:o}"), "wrote artifact");
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), LifecycleError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_error(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), LifecycleError> {
    Ok(())
}
