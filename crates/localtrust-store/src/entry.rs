//! Installed store entries and their metadata

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::FromDer;

use crate::StoreError;

/// The persisted form of a certificate inside a named logical store.
///
/// Metadata is extracted from the DER encoding at install time and kept in a
/// JSON sidecar next to the entry; the certificate bytes themselves stay in
/// `<fingerprint>.der`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledEntry {
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub has_bundle: bool,
    pub installed_at: DateTime<Utc>,
}

impl InstalledEntry {
    /// Build entry metadata from certificate DER bytes.
    pub(crate) fn from_der(
        der: &[u8],
        source: &Path,
        has_bundle: bool,
    ) -> Result<Self, StoreError> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| StoreError::Parse {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;

        let is_ca = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::BasicConstraints(bc) => Some(bc.ca),
                _ => None,
            })
            .unwrap_or(false);

        Ok(Self {
            fingerprint: localtrust_keygen::fingerprint(der),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            not_before: timestamp_to_utc(cert.validity().not_before.timestamp(), source)?,
            not_after: timestamp_to_utc(cert.validity().not_after.timestamp(), source)?,
            is_ca,
            has_bundle,
            installed_at: Utc::now(),
        })
    }

    /// Self-signed certificates act as trust anchors.
    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.not_after
    }

    pub fn is_not_yet_valid(&self) -> bool {
        Utc::now() < self.not_before
    }

    /// Within the validity window right now.
    pub fn is_currently_valid(&self) -> bool {
        !self.is_expired() && !self.is_not_yet_valid()
    }

    pub fn days_until_expiry(&self) -> i64 {
        (self.not_after - Utc::now()).num_days()
    }
}

fn timestamp_to_utc(timestamp: i64, source: &Path) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| StoreError::Parse {
            path: source.to_path_buf(),
            reason: format!("certificate validity timestamp {timestamp} out of range"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(not_before_offset_days: i64, not_after_offset_days: i64) -> InstalledEntry {
        InstalledEntry {
            fingerprint: "AA".repeat(32),
            subject: "CN=Test Root CA".to_string(),
            issuer: "CN=Test Root CA".to_string(),
            serial: "01".to_string(),
            not_before: Utc::now() + Duration::days(not_before_offset_days),
            not_after: Utc::now() + Duration::days(not_after_offset_days),
            is_ca: true,
            has_bundle: false,
            installed_at: Utc::now(),
        }
    }

    #[test]
    fn self_signed_detection() {
        let mut e = entry(-1, 365);
        assert!(e.is_self_signed());
        e.issuer = "CN=Someone Else".to_string();
        assert!(!e.is_self_signed());
    }

    #[test]
    fn validity_window() {
        assert!(entry(-1, 365).is_currently_valid());
        assert!(entry(-730, -1).is_expired());
        assert!(entry(1, 365).is_not_yet_valid());
        assert!(!entry(-730, -1).is_currently_valid());
    }

    #[test]
    fn days_until_expiry_counts_down() {
        assert!(entry(-1, 60).days_until_expiry() <= 60);
        assert!(entry(-1, 60).days_until_expiry() >= 59);
        assert!(entry(-730, -2).days_until_expiry() < 0);
    }
}
