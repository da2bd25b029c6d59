//! Content digests
//!
//! Result envelopes carry the SHA-256 of their serialized payload so a
//! rewrite of identical content can be detected and skipped.

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex-encoded SHA-256 of a JSON value's compact serialization
pub fn json_digest(value: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hex(&bytes))
}

/// Check a payload against the digest recorded for it
pub fn verify_json_digest(
    subject: &str,
    value: &serde_json::Value,
    expected: &str,
) -> Result<()> {
    let actual = json_digest(value)?;
    if actual == expected {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            subject: subject.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify_json_digest_mismatch() {
        let value = json!({"cve": {"id": "CVE-2002-0001"}});
        let err = verify_json_digest("cve-2002-0001", &value, "deadbeef").unwrap_err();
        assert!(matches!(err, CommonError::ChecksumMismatch { .. }));
    }
}
