//! Object metadata and its HMAC seal.
//!
//! Every stored block carries a sidecar JSON document recording the
//! plaintext size, the on-disk object size, the block checksum, and the
//! ordered transform chain with its materials. The document is sealed
//! with HMAC-SHA-256 computed over the canonical serialization of the
//! rest of the document (keys sorted, no whitespace) and the seal is
//! verified before any field is used. A mismatch is a data-integrity
//! failure and is never retried.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Result, VaultError};
use crate::transform::Materials;

const HMAC_KEY_FIELD: &str = "hmac";
const HMAC_ALGORITHM: &str = "sha256";

// ── Object metadata ──────────────────────────────────────────────────────────

/// One entry of the recorded transform chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRecord {
    pub name:      String,
    pub module:    String,
    pub materials: Materials,
}

/// Sidecar metadata of one stored block object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Plaintext bytes of the block.
    pub size:        u64,
    /// Bytes of the stored (encapsulated) object.
    pub object_size: u64,
    /// Full hex digest of the plaintext.
    pub checksum:    String,
    /// Transforms applied at write time, in write order.
    pub transforms:  Vec<TransformRecord>,
}

// ── JSON HMAC ────────────────────────────────────────────────────────────────

/// Seals and verifies JSON documents with a configured HMAC key.
///
/// The digest covers `serde_json::to_vec` of the document without its
/// `hmac` member; `serde_json` maps are BTree-backed, which yields the
/// sorted-key, no-whitespace canonical form the digest is defined over.
pub struct JsonHmac {
    key: Vec<u8>,
}

impl JsonHmac {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    fn hexdigest(&self, value: &serde_json::Value) -> Result<String> {
        let canonical = serde_json::to_vec(value)
            .map_err(|e| VaultError::Internal(format!("Metadata serialization failed: {e}")))?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|_| VaultError::Internal("HMAC key setup failed.".to_string()))?;
        mac.update(&canonical);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Attach the `hmac` member and serialize. The input must be a JSON
    /// object.
    pub fn seal_value(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        if !value.is_object() {
            return Err(VaultError::Internal(
                "Only JSON objects can carry an HMAC seal.".to_string(),
            ));
        }
        let digest = self.hexdigest(value)?;
        let mut sealed = value.clone();
        sealed.as_object_mut().and_then(|map| {
            map.insert(
                HMAC_KEY_FIELD.to_string(),
                serde_json::json!({ "algorithm": HMAC_ALGORITHM, "digest": digest }),
            )
        });
        serde_json::to_vec(&sealed)
            .map_err(|e| VaultError::Internal(format!("Metadata serialization failed: {e}")))
    }

    /// Parse, verify, and strip the `hmac` member. Any missing field,
    /// unknown algorithm, or digest mismatch fails verification.
    pub fn open_value(&self, raw: &[u8]) -> Result<serde_json::Value> {
        let mut value: serde_json::Value = serde_json::from_slice(raw).map_err(|e| {
            VaultError::Scrubbing(format!("Object metadata is not valid JSON: {e}."))
        })?;
        let map = value.as_object_mut().ok_or_else(|| {
            VaultError::Scrubbing("Object metadata is not a JSON object.".to_string())
        })?;
        let seal = map.remove(HMAC_KEY_FIELD).ok_or_else(|| {
            VaultError::Scrubbing(format!(
                "Object metadata is missing the required {HMAC_KEY_FIELD} member."
            ))
        })?;

        let algorithm = seal.get("algorithm").and_then(|v| v.as_str());
        if algorithm != Some(HMAC_ALGORITHM) {
            return Err(VaultError::Scrubbing(format!(
                "Unsupported object metadata HMAC algorithm {algorithm:?}."
            )));
        }
        let expected = seal
            .get("digest")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                VaultError::Scrubbing("Object metadata HMAC has no digest.".to_string())
            })?;

        let actual = self.hexdigest(&value)?;
        if actual != expected {
            return Err(VaultError::Scrubbing(format!(
                "Object metadata HMAC is invalid (expected {expected}, actual {actual})."
            )));
        }
        Ok(value)
    }

    pub fn seal_meta(&self, meta: &ObjectMeta) -> Result<Vec<u8>> {
        let value = serde_json::to_value(meta)
            .map_err(|e| VaultError::Internal(format!("Metadata serialization failed: {e}")))?;
        self.seal_value(&value)
    }

    pub fn open_meta(&self, raw: &[u8]) -> Result<ObjectMeta> {
        let value = self.open_value(raw)?;
        serde_json::from_value(value).map_err(|e| {
            VaultError::Scrubbing(format!("Object metadata has an invalid structure: {e}."))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ObjectMeta {
        ObjectMeta {
            size: 4096,
            object_size: 1234,
            checksum: "ab".repeat(32),
            transforms: vec![TransformRecord {
                name: "z1".to_string(),
                module: "zstd".to_string(),
                materials: [("original_size".to_string(), serde_json::Value::from(4096))]
                    .into_iter()
                    .collect(),
            }],
        }
    }

    #[test]
    fn seal_and_open_round_trip() {
        let hmac = JsonHmac::new(b"test-key".to_vec());
        let sealed = hmac.seal_meta(&sample_meta()).unwrap();
        let opened = hmac.open_meta(&sealed).unwrap();
        assert_eq!(opened.size, 4096);
        assert_eq!(opened.transforms.len(), 1);
    }

    #[test]
    fn any_bit_flip_is_detected() {
        let hmac = JsonHmac::new(b"test-key".to_vec());
        let sealed = hmac.seal_meta(&sample_meta()).unwrap();
        for position in [0, sealed.len() / 2, sealed.len() - 2] {
            let mut mutated = sealed.clone();
            // Stay within printable JSON so parsing still succeeds and
            // the failure is attributable to the HMAC itself.
            mutated[position] = if mutated[position] == b'1' { b'2' } else { b'1' };
            if serde_json::from_slice::<serde_json::Value>(&mutated).is_ok() {
                assert!(matches!(
                    hmac.open_meta(&mutated),
                    Err(VaultError::Scrubbing(_))
                ));
            }
        }
    }

    #[test]
    fn wrong_key_fails_verification() {
        let sealed = JsonHmac::new(b"key-a".to_vec()).seal_meta(&sample_meta()).unwrap();
        assert!(matches!(
            JsonHmac::new(b"key-b".to_vec()).open_meta(&sealed),
            Err(VaultError::Scrubbing(_))
        ));
    }

    #[test]
    fn missing_seal_is_rejected() {
        let raw = serde_json::to_vec(&sample_meta()).unwrap();
        assert!(JsonHmac::new(b"k".to_vec()).open_meta(&raw).is_err());
    }
}
