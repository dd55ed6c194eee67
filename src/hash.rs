//! Block fingerprinting: the content address of every stored block.
//!
//! The digest is a pure function of the block's plaintext bytes: never
//! salted, deterministic across processes and versions. The first 96 bits
//! of the digest become the block uid (see `version::BlockUid`), so any
//! configured algorithm must produce at least 96 bits of output; shorter
//! configurations are rejected at startup.
//!
//! The full hex digest travels with every block reference (`checksum`
//! column, object metadata) for audit and deep-scrub verification.

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Result, VaultError};

/// Smallest digest width that can carry a 96-bit block uid.
pub const MIN_DIGEST_BITS: u16 = 96;

// ── Algorithm selection ──────────────────────────────────────────────────────

/// A supported block-hash algorithm, parsed from the `hashFunction`
/// configuration key. BLAKE2b accepts any width between 96 and 512 bits
/// in whole bytes; SHA-2 widths are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Blake2b { digest_bits: u16 },
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Parse a configuration string: `blake2b` (256-bit default),
    /// `blake2b-<bits>`, `sha256`, or `sha512`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        let alg = match s.as_str() {
            "blake2b" => HashAlgorithm::Blake2b { digest_bits: 256 },
            "sha256" => HashAlgorithm::Sha256,
            "sha512" => HashAlgorithm::Sha512,
            _ => {
                if let Some(bits) = s.strip_prefix("blake2b-") {
                    let digest_bits: u16 = bits.parse().map_err(|_| {
                        VaultError::Configuration(format!(
                            "Invalid hashFunction digest width in {s}."
                        ))
                    })?;
                    HashAlgorithm::Blake2b { digest_bits }
                } else {
                    return Err(VaultError::Configuration(format!(
                        "Unknown hashFunction {s}."
                    )));
                }
            }
        };
        Ok(alg)
    }

    pub fn digest_bits(&self) -> u16 {
        match self {
            HashAlgorithm::Blake2b { digest_bits } => *digest_bits,
            HashAlgorithm::Sha256 => 256,
            HashAlgorithm::Sha512 => 512,
        }
    }

    pub fn name(&self) -> String {
        match self {
            HashAlgorithm::Blake2b { digest_bits } => format!("blake2b-{digest_bits}"),
            HashAlgorithm::Sha256 => "sha256".to_string(),
            HashAlgorithm::Sha512 => "sha512".to_string(),
        }
    }
}

// ── BlockHash ────────────────────────────────────────────────────────────────

/// Validated digest function. Constructing one proves the configured
/// width is a whole number of bytes wide enough for uid derivation.
#[derive(Debug, Clone, Copy)]
pub struct BlockHash {
    algorithm: HashAlgorithm,
}

impl BlockHash {
    pub fn new(algorithm: HashAlgorithm) -> Result<Self> {
        let bits = algorithm.digest_bits();
        if bits < MIN_DIGEST_BITS {
            return Err(VaultError::Configuration(format!(
                "hashFunction {} produces {} bits, the minimum is {} bits.",
                algorithm.name(),
                bits,
                MIN_DIGEST_BITS
            )));
        }
        if bits % 8 != 0 || bits > 512 {
            return Err(VaultError::Configuration(format!(
                "hashFunction {} has an unsupported digest width of {} bits.",
                algorithm.name(),
                bits
            )));
        }
        Ok(Self { algorithm })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Digest of a block's plaintext.
    pub fn digest(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            HashAlgorithm::Blake2b { digest_bits } => {
                let len = usize::from(digest_bits / 8);
                let mut hasher = Blake2bVar::new(len)
                    .map_err(|e| VaultError::Internal(format!("BLAKE2b setup failed: {e}")))?;
                hasher.update(data);
                let mut out = vec![0u8; len];
                hasher
                    .finalize_variable(&mut out)
                    .map_err(|e| VaultError::Internal(format!("BLAKE2b finalize failed: {e}")))?;
                Ok(out)
            }
            HashAlgorithm::Sha256 => Ok(Sha256::digest(data).to_vec()),
            HashAlgorithm::Sha512 => Ok(Sha512::digest(data).to_vec()),
        }
    }

    /// Hex form of [`digest`](Self::digest); the `checksum` carried by
    /// block references and object metadata.
    pub fn hexdigest(&self, data: &[u8]) -> Result<String> {
        Ok(hex::encode(self.digest(data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_blake2b_is_256_bits() {
        let alg = HashAlgorithm::parse("blake2b").unwrap();
        assert_eq!(alg.digest_bits(), 256);
        let h = BlockHash::new(alg).unwrap();
        assert_eq!(h.digest(b"").unwrap().len(), 32);
    }

    #[test]
    fn digest_is_deterministic_and_unsalted() {
        let h = BlockHash::new(HashAlgorithm::parse("blake2b").unwrap()).unwrap();
        assert_eq!(h.hexdigest(b"abc").unwrap(), h.hexdigest(b"abc").unwrap());
        assert_ne!(h.hexdigest(b"abc").unwrap(), h.hexdigest(b"abd").unwrap());
    }

    #[test]
    fn narrow_digests_are_rejected() {
        let alg = HashAlgorithm::parse("blake2b-64").unwrap();
        assert!(BlockHash::new(alg).is_err());
        // 96 bits is the smallest acceptable width.
        let alg = HashAlgorithm::parse("blake2b-96").unwrap();
        assert!(BlockHash::new(alg).is_ok());
    }

    #[test]
    fn sha2_widths() {
        let h = BlockHash::new(HashAlgorithm::parse("sha256").unwrap()).unwrap();
        assert_eq!(h.digest(b"x").unwrap().len(), 32);
        let h = BlockHash::new(HashAlgorithm::parse("sha512").unwrap()).unwrap();
        assert_eq!(h.digest(b"x").unwrap().len(), 64);
    }

    #[test]
    fn unknown_algorithm_is_a_configuration_error() {
        assert!(HashAlgorithm::parse("md4").is_err());
    }
}
