//! Filesystem-backed identity store for the localtrust PKI chain
//!
//! Certificates live in named logical stores (`root-trust`, `personal`)
//! under a single base directory, keyed by their fingerprint. The rest of
//! the system never touches store paths directly: it opens a [`StoreHandle`]
//! and goes through it.

pub mod entry;
pub mod handle;
mod lock;

pub use entry::InstalledEntry;
pub use handle::{StoreHandle, StoreIter};

use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Identity store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[error("fingerprint collision for {fingerprint}: existing entry holds different bytes")]
    DuplicateKeyConflict { fingerprint: String },

    #[error("no entry for fingerprint {fingerprint}")]
    NotFound { fingerprint: String },

    #[error("store was opened read-only")]
    ReadOnly,

    #[error("store lock at {path} is held by another process")]
    LockBusy { path: PathBuf },

    #[error("unparseable certificate at {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Logical store names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
    /// Trust anchors (self-signed roots).
    RootTrust,
    /// Server identities (leaf certificates with key bundles).
    Personal,
}

impl StoreName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootTrust => "root-trust",
            Self::Personal => "personal",
        }
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root-trust" => Ok(Self::RootTrust),
            "personal" => Ok(Self::Personal),
            other => Err(format!("unknown store name '{other}'")),
        }
    }
}

/// Open mode for a store handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    ReadOnly,
    ReadWrite,
}

/// Store location, resolved once at process start and injected.
#[derive(Debug, Clone)]
pub struct StoreLocationConfig {
    base_dir: PathBuf,
}

impl StoreLocationConfig {
    /// Resolve the default location: `~/.localtrust`.
    pub fn resolve() -> Result<Self, StoreError> {
        let home = dirs::home_dir().ok_or_else(|| StoreError::Unavailable {
            path: PathBuf::from("~"),
            reason: "home directory could not be determined".to_string(),
        })?;
        Ok(Self {
            base_dir: home.join(".localtrust"),
        })
    }

    /// Use an explicit base directory (tests, containers).
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &std::path::Path {
        &self.base_dir
    }

    pub(crate) fn store_dir(&self, name: StoreName) -> PathBuf {
        self.base_dir.join("stores").join(name.as_str())
    }
}

/// The identity store: a factory for per-store handles.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    location: StoreLocationConfig,
}

impl IdentityStore {
    pub fn new(location: StoreLocationConfig) -> Self {
        Self { location }
    }

    /// Open a handle on a logical store.
    ///
    /// `ReadWrite` handles hold an exclusive lock on the store for their
    /// whole lifetime; the lock is released on every exit path when the
    /// handle drops. `ReadOnly` handles never block other readers.
    pub fn open(&self, name: StoreName, mode: StoreMode) -> Result<StoreHandle, StoreError> {
        StoreHandle::open(self.location.store_dir(name), name, mode)
    }
}

/// Normalize a fingerprint for lookup: strip separators, uppercase.
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| !matches!(c, ':' | ' ' | '-'))
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_names_round_trip() {
        assert_eq!(StoreName::RootTrust.as_str(), "root-trust");
        assert_eq!(StoreName::Personal.as_str(), "personal");
        assert_eq!("root-trust".parse::<StoreName>(), Ok(StoreName::RootTrust));
        assert_eq!("personal".parse::<StoreName>(), Ok(StoreName::Personal));
        assert!("trusted".parse::<StoreName>().is_err());
    }

    #[test]
    fn fingerprints_are_normalized_for_lookup() {
        assert_eq!(
            normalize_fingerprint("ab:cd:ef"),
            "ABCDEF".to_string()
        );
        assert_eq!(normalize_fingerprint("ABCDEF"), "ABCDEF".to_string());
    }

    #[test]
    fn store_dirs_are_derived_from_base() {
        let location = StoreLocationConfig::with_base_dir("/tmp/lt");
        assert_eq!(
            location.store_dir(StoreName::RootTrust),
            PathBuf::from("/tmp/lt/stores/root-trust")
        );
    }
}
