//! Scoped store handles
//!
//! A handle scopes all reads and writes to one logical store directory.
//! Read-write handles hold the store's exclusive lock until dropped.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::entry::InstalledEntry;
use crate::lock::LockFile;
use crate::{normalize_fingerprint, StoreError, StoreMode, StoreName};

const CERT_EXTENSION: &str = "der";
const META_EXTENSION: &str = "json";
const BUNDLE_EXTENSION: &str = "bundle";

pub struct StoreHandle {
    name: StoreName,
    dir: PathBuf,
    mode: StoreMode,
    _lock: Option<LockFile>,
}

impl StoreHandle {
    pub(crate) fn open(
        dir: PathBuf,
        name: StoreName,
        mode: StoreMode,
    ) -> Result<Self, StoreError> {
        let lock = match mode {
            StoreMode::ReadWrite => {
                fs::create_dir_all(&dir).map_err(|e| StoreError::Unavailable {
                    path: dir.clone(),
                    reason: e.to_string(),
                })?;
                Some(LockFile::acquire(dir.join(".lock"))?)
            }
            StoreMode::ReadOnly => {
                if !dir.is_dir() {
                    return Err(StoreError::Unavailable {
                        path: dir,
                        reason: "store directory does not exist".to_string(),
                    });
                }
                None
            }
        };
        debug!(store = %name, mode = ?mode, "opened store");
        Ok(Self {
            name,
            dir,
            mode,
            _lock: lock,
        })
    }

    pub fn name(&self) -> StoreName {
        self.name
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Install certificate bytes (and an optional private-key bundle).
    ///
    /// Idempotent: installing byte-identical material again leaves exactly
    /// one entry and succeeds. The same fingerprint with different bytes is
    /// a [`StoreError::DuplicateKeyConflict`] and is never overwritten.
    pub fn install(
        &self,
        cert_der: &[u8],
        bundle: Option<&[u8]>,
    ) -> Result<InstalledEntry, StoreError> {
        self.require_write()?;
        let fingerprint = localtrust_keygen::fingerprint(cert_der);
        let cert_path = self.cert_path(&fingerprint);

        if cert_path.exists() {
            let existing = read_file(&cert_path)?;
            if existing != cert_der {
                return Err(StoreError::DuplicateKeyConflict { fingerprint });
            }
            // Same bytes: keep the single entry, refresh the bundle sidecar
            // if the caller brought one.
            if let Some(bundle_bytes) = bundle {
                self.write_atomic(&self.bundle_path(&fingerprint), bundle_bytes, 0o600)?;
            }
            let entry = self.load_entry(&fingerprint)?;
            debug!(store = %self.name, fingerprint = %fingerprint, "entry already installed");
            return Ok(entry);
        }

        self.write_atomic(&cert_path, cert_der, 0o644)?;
        if let Some(bundle_bytes) = bundle {
            self.write_atomic(&self.bundle_path(&fingerprint), bundle_bytes, 0o600)?;
        }
        let entry = InstalledEntry::from_der(cert_der, &cert_path, bundle.is_some())?;
        self.write_metadata(&entry)?;

        info!(
            store = %self.name,
            fingerprint = %fingerprint,
            subject = %entry.subject,
            "installed certificate"
        );
        Ok(entry)
    }

    /// Remove every entry whose subject contains `pattern`.
    ///
    /// Used before re-installing a root CA: stale same-subject roots with
    /// different keys must not survive a rotation.
    pub fn remove_by_subject_pattern(&self, pattern: &str) -> Result<usize, StoreError> {
        self.require_write()?;
        let mut removed = 0;
        for entry in self.list(None) {
            let entry = entry?;
            if entry.subject.contains(pattern) {
                self.remove_entry_files(&entry.fingerprint)?;
                info!(
                    store = %self.name,
                    fingerprint = %entry.fingerprint,
                    subject = %entry.subject,
                    "removed certificate"
                );
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Look up an entry by its fingerprint. Separators and case in the
    /// fingerprint are tolerated.
    pub fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<InstalledEntry>, StoreError> {
        let fingerprint = normalize_fingerprint(fingerprint);
        if !self.cert_path(&fingerprint).exists() {
            return Ok(None);
        }
        self.load_entry(&fingerprint).map(Some)
    }

    /// Read the certificate bytes for an installed entry.
    pub fn certificate_bytes(&self, fingerprint: &str) -> Result<Vec<u8>, StoreError> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let path = self.cert_path(&fingerprint);
        if !path.exists() {
            return Err(StoreError::NotFound { fingerprint });
        }
        read_file(&path)
    }

    /// Read the private-key bundle for an installed entry, if one was stored.
    pub fn bundle_bytes(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let fingerprint = normalize_fingerprint(fingerprint);
        if !self.cert_path(&fingerprint).exists() {
            return Err(StoreError::NotFound { fingerprint });
        }
        let path = self.bundle_path(&fingerprint);
        if !path.exists() {
            return Ok(None);
        }
        read_file(&path).map(Some)
    }

    /// Lazily iterate the store's entries, optionally filtered by a subject
    /// substring. Each call re-reads current store state, so iteration is
    /// restartable by calling `list` again.
    pub fn list(&self, subject_pattern: Option<&str>) -> StoreIter<'_> {
        StoreIter {
            handle: self,
            read_dir: fs::read_dir(&self.dir).ok(),
            pattern: subject_pattern.map(str::to_string),
        }
    }

    fn require_write(&self) -> Result<(), StoreError> {
        match self.mode {
            StoreMode::ReadWrite => Ok(()),
            StoreMode::ReadOnly => Err(StoreError::ReadOnly),
        }
    }

    fn cert_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.{CERT_EXTENSION}"))
    }

    fn meta_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.{META_EXTENSION}"))
    }

    fn bundle_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.{BUNDLE_EXTENSION}"))
    }

    fn load_entry(&self, fingerprint: &str) -> Result<InstalledEntry, StoreError> {
        let meta_path = self.meta_path(fingerprint);
        if let Ok(json) = fs::read_to_string(&meta_path) {
            if let Ok(mut entry) = serde_json::from_str::<InstalledEntry>(&json) {
                entry.has_bundle = self.bundle_path(fingerprint).exists();
                return Ok(entry);
            }
        }
        // Sidecar missing or corrupt: rebuild from the certificate itself.
        let cert_path = self.cert_path(fingerprint);
        let der = read_file(&cert_path)?;
        InstalledEntry::from_der(&der, &cert_path, self.bundle_path(fingerprint).exists())
    }

    fn write_metadata(&self, entry: &InstalledEntry) -> Result<(), StoreError> {
        let path = self.meta_path(&entry.fingerprint);
        let json = serde_json::to_vec_pretty(entry).map_err(|e| StoreError::Parse {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        self.write_atomic(&path, &json, 0o644)
    }

    fn remove_entry_files(&self, fingerprint: &str) -> Result<(), StoreError> {
        for path in [
            self.cert_path(fingerprint),
            self.meta_path(fingerprint),
            self.bundle_path(fingerprint),
        ] {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StoreError::Io { path, source: e })?;
            }
        }
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8], mode: u32) -> Result<(), StoreError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("entry");
        let tmp = self.dir.join(format!(".{file_name}.tmp"));
        fs::write(&tmp, bytes).map_err(|e| StoreError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        set_mode(&tmp, mode)?;
        fs::rename(&tmp, path).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Lazy iterator over store entries. See [`StoreHandle::list`].
pub struct StoreIter<'a> {
    handle: &'a StoreHandle,
    read_dir: Option<fs::ReadDir>,
    pattern: Option<String>,
}

impl Iterator for StoreIter<'_> {
    type Item = Result<InstalledEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let read_dir = self.read_dir.as_mut()?;
        loop {
            let dir_entry = match read_dir.next()? {
                Ok(e) => e,
                Err(e) => {
                    return Some(Err(StoreError::Io {
                        path: self.handle.dir.clone(),
                        source: e,
                    }))
                }
            };
            let path = dir_entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(CERT_EXTENSION) {
                continue;
            }
            let Some(fingerprint) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.handle.load_entry(fingerprint) {
                Ok(entry) => {
                    if let Some(ref pattern) = self.pattern {
                        if !entry.subject.contains(pattern.as_str()) {
                            continue;
                        }
                    }
                    return Some(Ok(entry));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, StoreError> {
    fs::read(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), StoreError> {
    Ok(())
}
