//! Fingerprint reference file
//!
//! A plain-text file holding the fingerprint of the currently active leaf
//! certificate. The server reads it at startup to find its identity in the
//! personal store; setup writes it last, so a reference on disk always points
//! at fully installed material.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use localtrust_store::normalize_fingerprint;

use crate::{io_error, LifecycleError};

const FINGERPRINT_HEX_LEN: usize = 64;

/// The on-disk pointer to the active leaf certificate.
#[derive(Debug, Clone)]
pub struct FingerprintReference {
    path: PathBuf,
}

impl FingerprintReference {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the referenced fingerprint.
    ///
    /// A missing or malformed file reads as `None`: the reference is a hint,
    /// and a bad one means setup has to run again, not that reads fail.
    pub fn read(&self) -> Result<Option<String>, LifecycleError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&self.path, e)),
        };
        let fingerprint = normalize_fingerprint(raw.trim());
        if fingerprint.len() != FINGERPRINT_HEX_LEN
            || !fingerprint.bytes().all(|b| b.is_ascii_hexdigit())
        {
            warn!(path = %self.path.display(), "ignoring malformed fingerprint reference");
            return Ok(None);
        }
        Ok(Some(fingerprint))
    }

    /// Atomically replace the reference with `fingerprint`.
    pub fn write(&self, fingerprint: &str) -> Result<(), LifecycleError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{fingerprint}\n")).map_err(|e| io_error(&tmp, e))?;
        set_mode(&tmp, 0o644)?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_reference_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let reference = FingerprintReference::new(dir.path().join("active"));
        assert_eq!(reference.read().unwrap(), None);
    }

    #[test]
    fn reference_round_trips() {
        let dir = TempDir::new().unwrap();
        let reference = FingerprintReference::new(dir.path().join("active"));
        let fingerprint = "AB".repeat(32);
        reference.write(&fingerprint).unwrap();
        assert_eq!(reference.read().unwrap(), Some(fingerprint));
    }

    #[test]
    fn separators_in_a_hand_edited_reference_are_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("active");
        let with_colons = "ab".repeat(32)
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join(":");
        std::fs::write(&path, format!("{with_colons}\n")).unwrap();
        let reference = FingerprintReference::new(&path);
        assert_eq!(reference.read().unwrap(), Some("AB".repeat(32)));
    }

    #[test]
    fn malformed_reference_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("active");
        std::fs::write(&path, "not a fingerprint\n").unwrap();
        let reference = FingerprintReference::new(&path);
        assert_eq!(reference.read().unwrap(), None);
    }

    #[test]
    fn write_replaces_the_previous_reference() {
        let dir = TempDir::new().unwrap();
        let reference = FingerprintReference::new(dir.path().join("active"));
        reference.write(&"AA".repeat(32)).unwrap();
        reference.write(&"BB".repeat(32)).unwrap();
        assert_eq!(reference.read().unwrap(), Some("BB".repeat(32)));
    }
}
