//! Data model: versions, block references, and their identities.
//!
//! A *version* is the immutable record of one backup: an ordered list of
//! block references plus counters and labels. A *block reference* maps a
//! zero-based index inside the version to a content-addressed block uid,
//! or to nothing at all when the region is known to be sparse.
//!
//! # Block uid
//! The uid is the content address: the first 96 bits of the block digest,
//! split into a `(left: 32, right: 64)` pair. Uniqueness is per storage
//! backend, not global. Two blocks with the same checksum always carry the
//! same uid.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

// ── BlockUid ─────────────────────────────────────────────────────────────────

/// Content address of a stored block, derived from its digest.
/// `left` occupies 32 bits, `right` 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockUid {
    pub left:  u64,
    pub right: u64,
}

impl BlockUid {
    /// Derive the uid from a block digest. The digest must be at least
    /// 12 bytes long, which `BlockHash` guarantees by construction.
    pub fn from_digest(digest: &[u8]) -> Result<Self> {
        if digest.len() < 12 {
            return Err(VaultError::Internal(format!(
                "Digest of {} bytes is too short for uid derivation.",
                digest.len()
            )));
        }
        let left = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as u64;
        let mut right_bytes = [0u8; 8];
        right_bytes.copy_from_slice(&digest[4..12]);
        let right = u64::from_be_bytes(right_bytes);
        Ok(Self { left, right })
    }

    /// Canonical textual form used in storage keys: fixed-width hex so
    /// listings sort consistently and the md5 sharding is stable.
    pub fn storage_key(&self) -> String {
        format!("{:08x}-{:016x}", self.left, self.right)
    }

    /// Parse the [`storage_key`](Self::storage_key) form.
    pub fn from_storage_key(key: &str) -> Result<Self> {
        let (left, right) = key.split_once('-').ok_or_else(|| {
            VaultError::Storage(format!("Invalid block key {key}."))
        })?;
        if left.len() != 8 || right.len() != 16 {
            return Err(VaultError::Storage(format!("Invalid block key {key}.")));
        }
        let left = u64::from_str_radix(left, 16)
            .map_err(|_| VaultError::Storage(format!("Invalid block key {key}.")))?;
        let right = u64::from_str_radix(right, 16)
            .map_err(|_| VaultError::Storage(format!("Invalid block key {key}.")))?;
        Ok(Self { left, right })
    }
}

impl fmt::Display for BlockUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

// ── VersionUid ───────────────────────────────────────────────────────────────

/// Opaque, globally unique, human-printable version identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionUid(String);

impl VersionUid {
    /// Generate a fresh uid: `v-` plus 12 hex characters of a random
    /// UUID. Collisions are caught by the database primary key.
    pub fn generate() -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        VersionUid(format!("v-{}", &raw[..12]))
    }

    pub fn new(s: impl Into<String>) -> Self {
        VersionUid(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── VersionStatus ────────────────────────────────────────────────────────────

/// Lifecycle state of a version. Created as `Incomplete`, flipped to
/// `Valid` on successful completion, and to `Invalid` when a scrub or a
/// restore verification fails. Once `Valid` it never becomes
/// `Incomplete` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Incomplete,
    Valid,
    Invalid,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Incomplete => "incomplete",
            VersionStatus::Valid => "valid",
            VersionStatus::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "incomplete" => Ok(VersionStatus::Incomplete),
            "valid" => Ok(VersionStatus::Valid),
            "invalid" => Ok(VersionStatus::Invalid),
            _ => Err(VaultError::Internal(format!("Unknown version status {s}."))),
        }
    }
}

// ── Version ──────────────────────────────────────────────────────────────────

/// One recorded backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub uid:        VersionUid,
    pub volume:     String,
    pub snapshot:   String,
    pub date:       DateTime<Utc>,
    /// Bytes covered by the version; always `block_count * block_size`.
    pub size:       u64,
    pub block_size: u32,
    pub storage_id: i64,
    pub status:     VersionStatus,
    pub protected:  bool,
    pub bytes_read:         u64,
    pub bytes_written:      u64,
    pub bytes_deduplicated: u64,
    pub bytes_sparse:       u64,
    /// Wall-clock seconds the producing operation took.
    pub duration:   u64,
    pub labels:     BTreeMap<String, String>,
}

impl Version {
    /// Number of block references the version holds.
    pub fn block_count(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        self.size / u64::from(self.block_size)
    }
}

// ── Block ────────────────────────────────────────────────────────────────────

/// One block reference inside a version. `uid` and `checksum` are both
/// absent exactly when the block is sparse (known all-zero, not stored).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub idx:      u64,
    pub uid:      Option<BlockUid>,
    pub checksum: Option<String>,
    /// Plaintext bytes this reference covers; equals the version's
    /// `block_size` except possibly for the final block.
    pub size:     u32,
}

impl Block {
    pub fn sparse(idx: u64, size: u32) -> Self {
        Block { idx, uid: None, checksum: None, size }
    }

    pub fn is_sparse(&self) -> bool {
        self.uid.is_none()
    }
}

// ── Exported metadata document ───────────────────────────────────────────────

/// Version of the exported metadata document format.
pub const METADATA_VERSION: &str = "1.0.0";

/// The JSON document exported to `versions/<uid>` in the storage after a
/// successful backup: the version row, its block references, and its
/// labels. Sealed with the storage's object HMAC on the way out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub metadata_version: String,
    pub version:          Version,
    pub blocks:           Vec<Block>,
}

impl VersionMetadata {
    pub fn new(version: Version, blocks: Vec<Block>) -> Self {
        VersionMetadata {
            metadata_version: METADATA_VERSION.to_string(),
            version,
            blocks,
        }
    }
}
