//! Transform registry: ordered, invertible per-block encodings.
//!
//! A transform maps a plaintext block to `(ciphertext, materials)` on the
//! way to storage and back on the way out. `materials` is a small
//! string-keyed mapping that rides along in the stored object's metadata
//! (wrapped envelope keys, nonces, original sizes). The write-time order
//! is compression first, then encryption; reads reverse the recorded
//! chain.
//!
//! # Identity rules
//! Every transform instance has a configured *name* (what block metadata
//! records) and a fixed *module* tag (which implementation it is). A
//! reader that encounters a chain entry whose name is not configured MUST
//! fail immediately; there is no fallback and no negotiation.
//!
//! Modules: `zstd` (compression), `aes_256_gcm` (envelope encryption with
//! a wrapped key), `aes_256_gcm_ecc` (envelope encryption with an
//! ephemeral ECDH key agreement).

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use serde::de::DeserializeOwned;
use sha2::Sha512;

use crate::error::{Result, VaultError};

pub mod aes_gcm;
pub mod ecc;
pub mod keywrap;
pub mod zstd;

/// Materials attached to one chain entry in the object metadata.
/// `BTreeMap` so the canonical JSON serialization is key-sorted.
pub type Materials = BTreeMap<String, serde_json::Value>;

// ── Transform trait ──────────────────────────────────────────────────────────

pub trait Transform: Send + Sync + std::fmt::Debug {
    /// Configured instance name; recorded in every chain entry.
    fn name(&self) -> &str;

    /// Implementation tag, one of the module constants.
    fn module(&self) -> &'static str;

    /// Encode a block. `Ok(None)` means the transform declined (e.g.
    /// compression that would not shrink the block) and must not appear
    /// in the recorded chain.
    fn encapsulate(&self, data: &[u8]) -> Result<Option<(Vec<u8>, Materials)>>;

    /// Reverse [`encapsulate`](Self::encapsulate) using the recorded
    /// materials. Data-integrity failures surface as
    /// [`VaultError::Scrubbing`] and are never retried.
    fn decapsulate(&self, data: &[u8], materials: &Materials) -> Result<Vec<u8>>;
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Instantiate a transform from its configuration section. Unknown
/// module tags fail hard; per-module options are schema-checked by the
/// module's own config struct.
pub fn new_transform(
    name: &str,
    module: &str,
    configuration: serde_yaml::Value,
) -> Result<Arc<dyn Transform>> {
    match module {
        zstd::MODULE => Ok(Arc::new(zstd::ZstdTransform::new(
            name,
            module_config(name, configuration)?,
        )?)),
        aes_gcm::MODULE => Ok(Arc::new(aes_gcm::AesGcmTransform::new(
            name,
            module_config(name, configuration)?,
        )?)),
        ecc::MODULE => Ok(Arc::new(ecc::EccTransform::new(
            name,
            module_config(name, configuration)?,
        )?)),
        _ => Err(VaultError::Configuration(format!(
            "Transform module {module} is undefined."
        ))),
    }
}

fn module_config<C: DeserializeOwned>(name: &str, value: serde_yaml::Value) -> Result<C> {
    serde_yaml::from_value(value).map_err(|e| {
        VaultError::Configuration(format!("Configuration for transform {name} is invalid: {e}."))
    })
}

// ── Shared helpers ───────────────────────────────────────────────────────────

/// PBKDF2-HMAC-SHA-512 key derivation for password-based master keys.
pub fn derive_key(salt: &[u8], iterations: u32, password: &str, key_length: usize) -> Vec<u8> {
    let mut key = vec![0u8; key_length];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut key);
    key
}

pub(crate) fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub(crate) fn b64_decode(context: &str, data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| VaultError::Transform(format!("Invalid base64 in {context}: {e}.")))
}

/// Fetch a required string entry from a materials mapping.
pub(crate) fn materials_str<'a>(materials: &'a Materials, key: &str) -> Result<&'a str> {
    materials
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            VaultError::Transform(format!("Materials are missing required key {key}."))
        })
}

/// Fetch a required integer entry from a materials mapping.
pub(crate) fn materials_u64(materials: &Materials, key: &str) -> Result<u64> {
    materials
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| {
            VaultError::Transform(format!("Materials are missing required key {key}."))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_matches_known_vector() {
        // PBKDF2-HMAC-SHA512, 1 iteration, from RFC 6070-style parameters.
        let key = derive_key(b"salt", 1, "password", 16);
        assert_eq!(hex::encode(&key), "867f70cf1ade02cff3752599a3a53dc4");
    }

    #[test]
    fn derive_key_is_sensitive_to_all_inputs() {
        let base = derive_key(b"salt", 100, "password", 32);
        assert_ne!(base, derive_key(b"salt2", 100, "password", 32));
        assert_ne!(base, derive_key(b"salt", 101, "password", 32));
        assert_ne!(base, derive_key(b"salt", 100, "passwore", 32));
    }

    #[test]
    fn unknown_module_fails_hard() {
        let err = new_transform("t1", "rot13", serde_yaml::Value::Null).unwrap_err();
        assert!(matches!(err, VaultError::Configuration(_)));
    }
}
