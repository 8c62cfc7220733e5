//! Download checksums and artifact digests.
//!
//! Registry bundles are published with a hex SHA-256 that is checked before
//! anything is extracted. Built artifacts are fingerprinted with blake3 and
//! the digest (`blake3:<hex>`) is recorded in the lockfile.

use std::path::Path;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{PluginError, PluginResult};

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify `data` against a published hex SHA-256 and return the digest.
///
/// The comparison runs in constant time over the decoded bytes.
///
/// # Errors
///
/// Returns [`PluginError::ChecksumMismatch`] if the checksum is missing,
/// malformed, or differs.
pub fn verify_sha256(package: &str, data: &[u8], expected: Option<&str>) -> PluginResult<String> {
    let actual = Sha256::digest(data);
    let actual_hex = hex::encode(actual);

    let mismatch = |expected: &str| PluginError::ChecksumMismatch {
        package: package.to_string(),
        expected: expected.to_string(),
        actual: actual_hex.clone(),
    };

    let Some(expected) = expected.map(str::trim).filter(|e| !e.is_empty()) else {
        return Err(mismatch("<none published>"));
    };
    let expected_hex = expected.strip_prefix("sha256:").unwrap_or(expected);
    let expected_bytes = hex::decode(expected_hex).map_err(|_| mismatch(expected))?;

    if !bool::from(actual.as_slice().ct_eq(&expected_bytes)) {
        return Err(mismatch(expected));
    }
    Ok(actual_hex)
}

/// `blake3:<hex>` digest of a byte slice.
#[must_use]
pub fn artifact_digest(data: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(data).to_hex())
}

/// `blake3:<hex>` digest of a file.
///
/// # Errors
///
/// Returns [`PluginError::Io`] if the file cannot be read.
pub fn artifact_hash(path: &Path) -> PluginResult<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| PluginError::io(format!("failed to read {}", path.display()), e))?;
    Ok(artifact_digest(&bytes))
}
