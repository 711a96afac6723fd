//! Exclusive store lock held for the duration of a write transaction
//!
//! Mutual exclusion between independent processes uses a lock file created
//! with `O_CREAT | O_EXCL` semantics. Store transactions are short-lived
//! local filesystem work, so acquisition waits briefly and then gives up
//! rather than blocking forever on a dead holder.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::StoreError;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_millis(50);
// A holder that kept the lock this long is assumed dead.
const STALE_AFTER: Duration = Duration::from_secs(60);

pub(crate) struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub(crate) fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    debug!(path = %path.display(), "acquired store lock");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::reclaim_stale(&path) {
                        continue;
                    }
                    if started.elapsed() >= ACQUIRE_TIMEOUT {
                        return Err(StoreError::LockBusy { path });
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(StoreError::Io { path, source: e });
                }
            }
        }
    }

    fn reclaim_stale(path: &PathBuf) -> bool {
        let Ok(metadata) = std::fs::metadata(path) else {
            // Holder released between our open attempt and now.
            return true;
        };
        let stale = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .map(|age| age >= STALE_AFTER)
            .unwrap_or(false);
        if stale {
            warn!(path = %path.display(), "removing stale store lock");
            std::fs::remove_file(path).is_ok()
        } else {
            false
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        } else {
            debug!(path = %self.path.display(), "released store lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");

        let guard = LockFile::acquire(path.clone()).unwrap();
        assert!(path.exists());

        drop(guard);
        assert!(!path.exists());

        // Re-acquirable after release
        let _guard = LockFile::acquire(path.clone()).unwrap();
        assert!(path.exists());
    }
}
