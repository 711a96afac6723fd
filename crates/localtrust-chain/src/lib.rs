//! Trust chain validation
//!
//! Builds the trust path from a leaf certificate up to a self-signed root
//! and classifies the result. A chain whose only defect is a self-signed
//! terminal missing from the trusted root store is classified as
//! [`ChainStatus::UntrustedRoot`], not as a hard failure: that is the
//! expected shape for a development CA, and callers decide how strict to be.

use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, trace};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::time::ASN1Time;

use localtrust_store::{StoreError, StoreHandle};

/// Walks longer than this are not a two-element dev chain gone right.
const MAX_CHAIN_DEPTH: usize = 8;

/// Chain validation errors (operational failures, not chain defects).
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("unparseable certificate: {0}")]
    Parse(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Classification of a chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChainStatus {
    /// Walk reached a self-signed terminal present in the trusted root store.
    Valid,
    /// Walk reached a self-signed terminal that the root store does not hold.
    UntrustedRoot,
    Expired,
    NotYetValid,
    SignatureMismatch,
    RootNotFound,
}

impl ChainStatus {
    /// Hard failures abort callers; the rest are policy decisions.
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, Self::SignatureMismatch | Self::RootNotFound)
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Valid => "valid",
            Self::UntrustedRoot => "untrusted-root",
            Self::Expired => "expired",
            Self::NotYetValid => "not-yet-valid",
            Self::SignatureMismatch => "signature-mismatch",
            Self::RootNotFound => "root-not-found",
        };
        f.write_str(s)
    }
}

/// One link of the walked chain, leaf first.
#[derive(Debug, Clone)]
pub struct ChainElement {
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub der: Vec<u8>,
}

impl ChainElement {
    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }
}

/// Outcome of a chain walk.
///
/// `elements` always holds the full walked path (leaf → root) even when the
/// chain has defects, so diagnostics can show what was found.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub valid: bool,
    pub elements: Vec<ChainElement>,
    pub status_codes: BTreeSet<ChainStatus>,
}

impl ChainResult {
    /// True when the sole defect is an untrusted self-signed root, the
    /// accepted self-signed-CA case.
    pub fn untrusted_root_only(&self) -> bool {
        self.status_codes.len() == 1 && self.status_codes.contains(&ChainStatus::UntrustedRoot)
    }

    /// True when any status aborts strict callers.
    pub fn has_hard_failure(&self) -> bool {
        self.status_codes.iter().any(ChainStatus::is_hard_failure)
    }
}

/// Validate a leaf against the trusted root store.
pub fn validate(leaf_der: &[u8], root_store: &StoreHandle) -> Result<ChainResult, ChainError> {
    validate_with_extras(leaf_der, root_store, &[])
}

/// Validate a leaf, additionally considering `extras` as issuer candidates.
///
/// Extras participate in issuer resolution but confer no trust: a terminal
/// found only among the extras still classifies as `UntrustedRoot`. This is
/// how externally supplied material (a bundle carrying its own root) is
/// validated before the root lands in the store.
pub fn validate_with_extras(
    leaf_der: &[u8],
    root_store: &StoreHandle,
    extras: &[Vec<u8>],
) -> Result<ChainResult, ChainError> {
    let mut trusted_fingerprints = BTreeSet::new();
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    for entry in root_store.list(None) {
        let entry = entry?;
        trusted_fingerprints.insert(entry.fingerprint.clone());
        candidates.push(root_store.certificate_bytes(&entry.fingerprint)?);
    }
    candidates.extend(extras.iter().cloned());

    let now = ASN1Time::now();
    let mut chain: Vec<Vec<u8>> = vec![leaf_der.to_vec()];
    let mut status_codes = BTreeSet::new();
    let mut completed = false;

    loop {
        let current = chain
            .last()
            .cloned()
            .unwrap_or_default();
        let cert = parse(&current)?;

        if cert.validity().not_after < now {
            status_codes.insert(ChainStatus::Expired);
        }
        if cert.validity().not_before > now {
            status_codes.insert(ChainStatus::NotYetValid);
        }

        if cert.subject() == cert.issuer() {
            // Self-signed terminal reached.
            if cert.verify_signature(None).is_err() {
                status_codes.insert(ChainStatus::SignatureMismatch);
                break;
            }
            let fingerprint = localtrust_keygen::fingerprint(&current);
            if trusted_fingerprints.contains(&fingerprint) {
                status_codes.insert(ChainStatus::Valid);
            } else {
                status_codes.insert(ChainStatus::UntrustedRoot);
            }
            completed = true;
            break;
        }

        if chain.len() >= MAX_CHAIN_DEPTH {
            debug!(depth = chain.len(), "chain walk exceeded maximum depth");
            status_codes.insert(ChainStatus::RootNotFound);
            break;
        }

        let mut subject_matched = false;
        let mut next: Option<Vec<u8>> = None;
        for candidate_der in &candidates {
            let Ok(candidate) = parse(candidate_der) else {
                continue;
            };
            if candidate.subject() != cert.issuer() {
                continue;
            }
            subject_matched = true;
            if cert.verify_signature(Some(candidate.public_key())).is_ok() {
                next = Some(candidate_der.clone());
                break;
            }
            trace!(issuer = %candidate.subject(), "issuer subject matched but signature did not verify");
        }

        match next {
            Some(issuer_der) => chain.push(issuer_der),
            None => {
                status_codes.insert(if subject_matched {
                    ChainStatus::SignatureMismatch
                } else {
                    ChainStatus::RootNotFound
                });
                break;
            }
        }
    }

    let elements = chain
        .iter()
        .map(|der| {
            let cert = parse(der)?;
            Ok(ChainElement {
                fingerprint: localtrust_keygen::fingerprint(der),
                subject: cert.subject().to_string(),
                issuer: cert.issuer().to_string(),
                der: der.clone(),
            })
        })
        .collect::<Result<Vec<_>, ChainError>>()?;

    let valid = completed
        && !status_codes.contains(&ChainStatus::Expired)
        && !status_codes.contains(&ChainStatus::NotYetValid)
        && !status_codes.iter().any(ChainStatus::is_hard_failure);

    debug!(
        valid,
        elements = elements.len(),
        statuses = ?status_codes,
        "chain walk finished"
    );

    Ok(ChainResult {
        valid,
        elements,
        status_codes,
    })
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, ChainError> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| ChainError::Parse(e.to_string()))
}
