//! Certificate lifecycle orchestration
//!
//! Drives generation → store installation → fingerprint recording → chain
//! validation. Two invocation paths share the machinery:
//!
//! - **full setup** ([`setup::full_setup`]): operator-invoked, generates new
//!   root and leaf material from scratch and installs it;
//! - **install-only** ([`install::install_only`]): container-startup path
//!   that installs pre-generated material and skips generation entirely.

pub mod artifacts;
pub mod install;
pub mod reference;
pub mod setup;
pub mod tls;

pub use artifacts::SetupArtifacts;
pub use install::{install_only, InstallConfig, InstallOutcome};
pub use reference::FingerprintReference;
pub use setup::{full_setup, SetupConfig, SetupOutcome};
pub use tls::{
    resolve_server_identity, ServerIdentity, ServerIdentitySource, StoreScope, TlsIdentityConfig,
};

use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

use localtrust_chain::{ChainError, ChainStatus};
use localtrust_keygen::GenerationError;
use localtrust_store::StoreError;

/// Lifecycle orchestration errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("missing certificate file: {path}")]
    MissingCertificateFile { path: PathBuf },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("chain validation failed during {stage}: {}", format_statuses(.statuses))]
    ChainValidationFailure {
        stage: &'static str,
        statuses: BTreeSet<ChainStatus>,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn format_statuses(statuses: &BTreeSet<ChainStatus>) -> String {
    statuses
        .iter()
        .map(ChainStatus::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// States of the lifecycle machine. Generation states are skipped on the
/// install-only path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    RootGenerated,
    LeafGenerated,
    Bundled,
    RootInstalled,
    LeafInstalled,
    Validated,
    Complete,
}

pub(crate) fn advance(state: &mut LifecycleState, next: LifecycleState) {
    debug!(from = ?state, to = ?next, "lifecycle transition");
    *state = next;
}

pub(crate) fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> LifecycleError {
    LifecycleError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_failure_message_names_stage_and_statuses() {
        let err = LifecycleError::ChainValidationFailure {
            stage: "full setup",
            statuses: BTreeSet::from([ChainStatus::Expired, ChainStatus::UntrustedRoot]),
        };
        let message = err.to_string();
        assert!(message.contains("full setup"));
        assert!(message.contains("expired"));
        assert!(message.contains("untrusted-root"));
    }
}
