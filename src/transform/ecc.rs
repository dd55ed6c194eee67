//! AES-256-GCM block encryption with ECDH-derived envelope keys.
//!
//! Variant of the `aes_256_gcm` module for deployments where the backup
//! host should not hold a decryption-capable key: the configuration
//! carries a NIST P-384 key, and each block's envelope key is derived by
//! ECDH between a fresh ephemeral key pair and that key. With only the
//! public half configured, blocks can be written but never read back;
//! decapsulation requires the private half.
//!
//! `materials.envelope_key` carries the ephemeral public key (compressed
//! SEC1, base64). The legacy field name `ecc_envelope_key` is accepted
//! on read for data written by older deployments.

use p384::ecdh::diffie_hellman;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, VaultError};
use crate::transform::aes_gcm::{decrypt, encrypt, random_nonce, AES_KEY_LEN};
use crate::transform::{b64_decode, b64_encode, materials_str, Materials, Transform};

pub const MODULE: &str = "aes_256_gcm_ecc";

/// The only curve this module supports.
pub const CURVE: &str = "NIST P-384";

/// Byte length of a raw P-384 secret scalar.
const SECRET_LEN: usize = 48;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EccConfig {
    /// Base64: either a raw 48-byte secret scalar (decrypt-capable) or a
    /// SEC1-encoded public point (encrypt-only).
    pub ecc_key: String,
    #[serde(default = "default_curve")]
    pub ecc_curve: String,
}

fn default_curve() -> String {
    CURVE.to_string()
}

#[derive(Debug)]
pub struct EccTransform {
    name:   String,
    public: PublicKey,
    secret: Option<SecretKey>,
}

impl EccTransform {
    pub fn new(name: &str, config: EccConfig) -> Result<Self> {
        if config.ecc_curve != CURVE {
            return Err(VaultError::Configuration(format!(
                "Key eccKey does not match the eccCurve setting. Found: {}, expected: {CURVE}.",
                config.ecc_curve
            )));
        }
        let raw = b64_decode("eccKey", &config.ecc_key)
            .map_err(|_| VaultError::Configuration("Key eccKey is not valid base64.".into()))?;

        let (public, secret) = if raw.len() == SECRET_LEN {
            let secret = SecretKey::from_slice(&raw).map_err(|_| {
                VaultError::Configuration("Key eccKey is not a valid P-384 secret key.".into())
            })?;
            (secret.public_key(), Some(secret))
        } else {
            let public = PublicKey::from_sec1_bytes(&raw).map_err(|_| {
                VaultError::Configuration("Key eccKey is not a valid P-384 public key.".into())
            })?;
            (public, None)
        };

        Ok(Self { name: name.to_string(), public, secret })
    }

    fn shared_envelope_key(secret: &SecretKey, public: &PublicKey) -> [u8; AES_KEY_LEN] {
        let shared = diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
        let digest = Sha256::digest(shared.raw_secret_bytes());
        let mut key = [0u8; AES_KEY_LEN];
        key.copy_from_slice(&digest);
        key
    }
}

impl Transform for EccTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn encapsulate(&self, data: &[u8]) -> Result<Option<(Vec<u8>, Materials)>> {
        let ephemeral = SecretKey::random(&mut OsRng);
        let envelope_key = Self::shared_envelope_key(&ephemeral, &self.public);
        let nonce = random_nonce();

        let ciphertext = encrypt(&envelope_key, &nonce, data)?;

        let ephemeral_public = ephemeral.public_key().to_encoded_point(true);
        let mut materials = Materials::new();
        materials.insert(
            "envelope_key".to_string(),
            b64_encode(ephemeral_public.as_bytes()).into(),
        );
        materials.insert("iv".to_string(), b64_encode(&nonce).into());
        Ok(Some((ciphertext, materials)))
    }

    fn decapsulate(&self, data: &[u8], materials: &Materials) -> Result<Vec<u8>> {
        let secret = self.secret.as_ref().ok_or_else(|| {
            VaultError::Configuration(
                "Key eccKey does not include private key data, cannot decrypt.".to_string(),
            )
        })?;

        // Older deployments recorded the ephemeral key under
        // ecc_envelope_key; accept both.
        let packed = match materials_str(materials, "envelope_key") {
            Ok(value) => value,
            Err(_) => materials_str(materials, "ecc_envelope_key")?,
        };
        let peer = PublicKey::from_sec1_bytes(&b64_decode("envelope_key", packed)?)
            .map_err(|_| {
                VaultError::Transform(
                    "Encryption materials envelope_key is not a valid P-384 public key."
                        .to_string(),
                )
            })?;
        let nonce = b64_decode("iv", materials_str(materials, "iv")?)?;

        let envelope_key = Self::shared_envelope_key(secret, &peer);
        decrypt(&envelope_key, &nonce, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (String, String) {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(true);
        (
            b64_encode(&secret.to_bytes()),
            b64_encode(public.as_bytes()),
        )
    }

    fn transform(key: &str) -> EccTransform {
        EccTransform::new(
            "ecc",
            EccConfig { ecc_key: key.to_string(), ecc_curve: default_curve() },
        )
        .unwrap()
    }

    #[test]
    fn round_trip_with_private_key() {
        let (secret, _) = keypair();
        let t = transform(&secret);
        let data = b"block sealed to a curve point".to_vec();
        let (ciphertext, materials) = t.encapsulate(&data).unwrap().unwrap();
        assert_eq!(t.decapsulate(&ciphertext, &materials).unwrap(), data);
    }

    #[test]
    fn public_key_encrypts_but_cannot_decrypt() {
        let (secret, public) = keypair();
        let encrypt_only = transform(&public);
        let decrypt_capable = transform(&secret);

        let (ciphertext, materials) = encrypt_only.encapsulate(b"payload").unwrap().unwrap();
        assert!(matches!(
            encrypt_only.decapsulate(&ciphertext, &materials),
            Err(VaultError::Configuration(_))
        ));
        assert_eq!(
            decrypt_capable.decapsulate(&ciphertext, &materials).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn legacy_materials_field_name_is_accepted() {
        let (secret, _) = keypair();
        let t = transform(&secret);
        let (ciphertext, mut materials) = t.encapsulate(b"old data").unwrap().unwrap();
        let packed = materials.remove("envelope_key").unwrap();
        materials.insert("ecc_envelope_key".to_string(), packed);
        assert_eq!(t.decapsulate(&ciphertext, &materials).unwrap(), b"old data");
    }

    #[test]
    fn ciphertexts_differ_for_identical_plaintext() {
        let (secret, _) = keypair();
        let t = transform(&secret);
        let (c1, _) = t.encapsulate(b"same").unwrap().unwrap();
        let (c2, _) = t.encapsulate(b"same").unwrap().unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn mismatched_curve_is_rejected() {
        let (secret, _) = keypair();
        let err = EccTransform::new(
            "ecc",
            EccConfig { ecc_key: secret, ecc_curve: "NIST P-256".to_string() },
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Configuration(_)));
    }
}
