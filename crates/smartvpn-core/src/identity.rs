//! Certificate fingerprints for peer identification in logs.
//!
//! fingerprint = SHA-256(DER certificate), hex-encoded.

use sha2::{Digest, Sha256};

/// Number of hex characters shown for a shortened fingerprint.
pub const SHORT_FINGERPRINT_LEN: usize = 16;

/// Compute the full hex-encoded SHA-256 fingerprint of a DER certificate.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    let hash = Sha256::digest(der);
    hex::encode(hash)
}

/// Shorten a fingerprint for display.
pub fn short_fingerprint(fp: &str) -> &str {
    &fp[..SHORT_FINGERPRINT_LEN.min(fp.len())]
}
