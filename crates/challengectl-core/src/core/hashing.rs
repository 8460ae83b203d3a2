// crates/challengectl-core/src/core/hashing.rs
// ============================================================================
// Module: ChallengeCtl Content Hashing
// Description: SHA-256 digest utilities for content-addressed file storage.
// Purpose: Give the blob store and the runner agent a single digest format.
// Dependencies: serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! Every file handed to a runner is named by the SHA-256 digest of its bytes.
//! This module provides the one digest routine both the controller (C2 File
//! Blob Store) and the runner agent (C8 file cache) rely on so the two sides
//! can never disagree about what "the digest" of a file means.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

use crate::core::identifiers::FileDigest;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while canonicalizing configuration for hashing.
#[derive(Debug, Error)]
pub enum CanonicalizeError {
    /// Serialization to canonical JSON failed.
    #[error("failed to canonicalize json: {0}")]
    Json(String),
}

// ============================================================================
// SECTION: Digest Helpers
// ============================================================================

/// Computes the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> FileDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    FileDigest::new(hex_encode(&digest))
}

/// Returns canonical (RFC 8785) JSON bytes for a serializable value.
///
/// # Errors
///
/// Returns [`CanonicalizeError`] when serialization fails.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonicalizeError> {
    serde_jcs::to_vec(value).map_err(|err| CanonicalizeError::Json(err.to_string()))
}

/// Encodes bytes as a lowercase hex string.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_matches_known_digest() {
        let digest = sha256_hex(b"");
        assert_eq!(
            digest.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
        );
    }

    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(sha256_hex(b"hello"), sha256_hex(b"hello"));
        assert_ne!(sha256_hex(b"hello"), sha256_hex(b"world"));
    }
}
