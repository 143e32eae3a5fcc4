//! Content checksum over the assembled payload.

use sha2::{Digest, Sha256};

use crate::payload::PublicProfile;
use crate::project::ProjectError;

/// SHA-256 hex digest over the payload's canonical JSON bytes.
///
/// serde_json serializes struct fields in declaration order and `BTreeMap`
/// keys in sorted order, so the byte stream — and the digest — is stable
/// for a given logical payload.
pub fn payload_checksum(payload: &PublicProfile) -> Result<String, ProjectError> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| ProjectError::Serialize(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
