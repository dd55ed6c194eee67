//! AES-256-GCM block encryption with per-block envelope keys.
//!
//! Every block is encrypted under a fresh 256-bit envelope key with a
//! fresh 96-bit nonce; the envelope key travels RFC 3394-wrapped under
//! the master key in the chain materials. Identical plaintext therefore
//! never produces identical ciphertext, while the block uid (derived
//! from the plaintext digest) still deduplicates it.
//!
//! The master key is either supplied directly (32 raw bytes, base64 in
//! the configuration) or derived from `(kdfSalt, kdfIterations,
//! password)` via PBKDF2-HMAC-SHA-512.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;

use crate::error::{Result, VaultError};
use crate::transform::{
    b64_decode, b64_encode, derive_key, keywrap, materials_str, Materials, Transform,
};

pub const MODULE: &str = "aes_256_gcm";

pub const AES_KEY_LEN: usize = 32;
/// Byte length of the random GCM nonce recorded as `iv`.
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AesGcmConfig {
    #[serde(default)]
    pub master_key:     Option<String>,
    #[serde(default)]
    pub kdf_salt:       Option<String>,
    #[serde(default)]
    pub kdf_iterations: Option<u32>,
    #[serde(default)]
    pub password:       Option<String>,
}

/// Resolve the configured master key: direct `masterKey` wins, else the
/// PBKDF2 triple is required in full.
pub(crate) fn master_key_from_config(config: &AesGcmConfig) -> Result<[u8; AES_KEY_LEN]> {
    if let Some(encoded) = &config.master_key {
        let raw = b64_decode("masterKey", encoded)
            .map_err(|_| VaultError::Configuration("Key masterKey is not valid base64.".into()))?;
        if raw.len() != AES_KEY_LEN {
            return Err(VaultError::Configuration(format!(
                "Key masterKey has the wrong length. It must be {AES_KEY_LEN} bytes long and encoded as base64."
            )));
        }
        let mut key = [0u8; AES_KEY_LEN];
        key.copy_from_slice(&raw);
        return Ok(key);
    }

    match (&config.kdf_salt, config.kdf_iterations, &config.password) {
        (Some(salt), Some(iterations), Some(password)) => {
            let salt = b64_decode("kdfSalt", salt)
                .map_err(|_| VaultError::Configuration("Key kdfSalt is not valid base64.".into()))?;
            let derived = derive_key(&salt, iterations, password, AES_KEY_LEN);
            let mut key = [0u8; AES_KEY_LEN];
            key.copy_from_slice(&derived);
            Ok(key)
        }
        _ => Err(VaultError::Configuration(
            "Either masterKey or all of kdfSalt, kdfIterations and password must be configured."
                .to_string(),
        )),
    }
}

pub(crate) fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub(crate) fn encrypt(key: &[u8; AES_KEY_LEN], nonce: &[u8; NONCE_LEN], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| VaultError::Internal("AES-256-GCM key setup failed.".to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), data)
        .map_err(|_| VaultError::Transform("AES-256-GCM encryption failed.".to_string()))
}

pub(crate) fn decrypt(key: &[u8; AES_KEY_LEN], nonce: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(VaultError::Transform(format!(
            "Encryption materials iv has wrong length of {}. It must be {NONCE_LEN} bytes long.",
            nonce.len()
        )));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| VaultError::Internal("AES-256-GCM key setup failed.".to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), data)
        .map_err(|_| {
            VaultError::Scrubbing(
                "AES-256-GCM tag verification failed, wrong key or corrupted data.".to_string(),
            )
        })
}

// ── Transform ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct AesGcmTransform {
    name:       String,
    master_key: [u8; AES_KEY_LEN],
}

impl AesGcmTransform {
    pub fn new(name: &str, config: AesGcmConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            master_key: master_key_from_config(&config)?,
        })
    }
}

impl Transform for AesGcmTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn encapsulate(&self, data: &[u8]) -> Result<Option<(Vec<u8>, Materials)>> {
        let mut envelope_key = [0u8; AES_KEY_LEN];
        OsRng.fill_bytes(&mut envelope_key);
        let wrapped = keywrap::wrap_key(&self.master_key, &envelope_key)?;
        let nonce = random_nonce();

        let ciphertext = encrypt(&envelope_key, &nonce, data)?;

        let mut materials = Materials::new();
        materials.insert("envelope_key".to_string(), b64_encode(&wrapped).into());
        materials.insert("iv".to_string(), b64_encode(&nonce).into());
        Ok(Some((ciphertext, materials)))
    }

    fn decapsulate(&self, data: &[u8], materials: &Materials) -> Result<Vec<u8>> {
        let wrapped = b64_decode("envelope_key", materials_str(materials, "envelope_key")?)?;
        let nonce = b64_decode("iv", materials_str(materials, "iv")?)?;

        let envelope_key = keywrap::unwrap_key(&self.master_key, &wrapped)?;
        if envelope_key.len() != AES_KEY_LEN {
            return Err(VaultError::Transform(format!(
                "Unwrapped envelope key has wrong length of {}. It must be {AES_KEY_LEN} bytes long.",
                envelope_key.len()
            )));
        }
        let mut key = [0u8; AES_KEY_LEN];
        key.copy_from_slice(&envelope_key);
        decrypt(&key, &nonce, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform() -> AesGcmTransform {
        AesGcmTransform::new(
            "enc",
            AesGcmConfig {
                master_key: Some(b64_encode(&[7u8; 32])),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn round_trip() {
        let t = transform();
        let data = b"confidential block payload".to_vec();
        let (ciphertext, materials) = t.encapsulate(&data).unwrap().unwrap();
        assert_ne!(ciphertext, data);
        assert_eq!(t.decapsulate(&ciphertext, &materials).unwrap(), data);
    }

    #[test]
    fn fresh_envelope_key_and_nonce_per_block() {
        let t = transform();
        let data = vec![0xabu8; 512];
        let (c1, m1) = t.encapsulate(&data).unwrap().unwrap();
        let (c2, m2) = t.encapsulate(&data).unwrap().unwrap();
        assert_ne!(c1, c2);
        assert_ne!(m1.get("envelope_key"), m2.get("envelope_key"));
        assert_ne!(m1.get("iv"), m2.get("iv"));
    }

    #[test]
    fn tampered_ciphertext_fails_tag_verification() {
        let t = transform();
        let (mut ciphertext, materials) = t.encapsulate(b"payload").unwrap().unwrap();
        ciphertext[0] ^= 0x80;
        let err = t.decapsulate(&ciphertext, &materials).unwrap_err();
        assert!(matches!(err, VaultError::Scrubbing(_)));
    }

    #[test]
    fn wrong_master_key_fails_the_unwrap() {
        let t1 = transform();
        let t2 = AesGcmTransform::new(
            "enc",
            AesGcmConfig {
                master_key: Some(b64_encode(&[8u8; 32])),
                ..Default::default()
            },
        )
        .unwrap();
        let (ciphertext, materials) = t1.encapsulate(b"payload").unwrap().unwrap();
        assert!(t2.decapsulate(&ciphertext, &materials).is_err());
    }

    #[test]
    fn kdf_master_key_is_accepted() {
        let t = AesGcmTransform::new(
            "enc",
            AesGcmConfig {
                master_key: None,
                kdf_salt: Some(b64_encode(b"0123456789abcdef")),
                kdf_iterations: Some(1000),
                password: Some("correct horse".to_string()),
            },
        )
        .unwrap();
        let (ciphertext, materials) = t.encapsulate(b"x").unwrap().unwrap();
        assert_eq!(t.decapsulate(&ciphertext, &materials).unwrap(), b"x");
    }

    #[test]
    fn incomplete_kdf_configuration_is_rejected() {
        let err = AesGcmTransform::new(
            "enc",
            AesGcmConfig {
                password: Some("pw".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Configuration(_)));
    }
}
