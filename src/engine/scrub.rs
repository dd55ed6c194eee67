//! Scrub: verify a version against its stored blocks.
//!
//! Two depths. The metadata scrub checks that every referenced object
//! exists with the recorded encapsulated length and an intact metadata
//! HMAC. The deep scrub additionally fetches each object, reverses its
//! transform chain, and recomputes the block hash.
//!
//! All sampled blocks are checked even after the first failure, so one
//! pass reports the full damage. Any failure marks the version
//! `invalid`; a clean pass changes nothing, and only a complete
//! (100 %) pass counts as full verification.

use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tracing::{error, info};

use crate::engine::Engine;
use crate::error::{Result, VaultError};
use crate::executor::JobExecutor;
use crate::version::{Version, VersionStatus, VersionUid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrubDepth {
    Metadata,
    Deep,
}

#[derive(Debug, Serialize)]
pub struct ScrubReport {
    pub version_uid:    VersionUid,
    pub depth:          ScrubDepth,
    /// Non-sparse references the version holds.
    pub total_blocks:   u64,
    pub checked_blocks: u64,
    /// Whether every block was checked (no sampling).
    pub complete_pass:  bool,
}

impl Engine {
    /// Scrub `version_uid` at the given depth. `block_percentage`
    /// samples a random subset; only a 100 % pass is full verification,
    /// but a failure found in any subset still marks the version
    /// `invalid`.
    pub fn scrub(
        &mut self,
        version_uid: &VersionUid,
        depth: ScrubDepth,
        block_percentage: u8,
    ) -> Result<ScrubReport> {
        if !(1..=100).contains(&block_percentage) {
            return Err(VaultError::Usage(format!(
                "block-percentage must be between 1 and 100, got {block_percentage}."
            )));
        }
        let version = self.db.version_by_uid(version_uid)?;
        let lock_name = format!("version/{version_uid}");
        self.acquire_lock(&lock_name, "scrub")?;
        let result = self.scrub_locked(&version, depth, block_percentage);
        self.release_lock(&lock_name);
        result
    }

    fn scrub_locked(
        &mut self,
        version: &Version,
        depth: ScrubDepth,
        block_percentage: u8,
    ) -> Result<ScrubReport> {
        let storage = self.storage_by_id(version.storage_id)?;
        let blocks = self.db.blocks_by_version(&version.uid)?;
        let non_sparse: Vec<_> = blocks.into_iter().filter(|b| !b.is_sparse()).collect();
        let total_blocks = non_sparse.len() as u64;

        let mut rng = rand::thread_rng();
        let sample: Vec<_> = if block_percentage == 100 {
            non_sparse
        } else {
            non_sparse
                .into_iter()
                .filter(|_| rng.gen_ratio(u32::from(block_percentage), 100))
                .collect()
        };
        let checked_blocks = sample.len() as u64;
        let hash = self.block_hash;

        let mut read_ex: JobExecutor<(u64, Option<String>)> =
            JobExecutor::new("scrub-read", storage.simultaneous_reads(), false);
        for block in sample {
            let storage = Arc::clone(&storage);
            let block_uid = block.uid.ok_or_else(|| {
                VaultError::Internal("Sparse block slipped into the scrub sample.".to_string())
            })?;
            let checksum = block.checksum.clone().ok_or_else(|| {
                VaultError::Internal(format!(
                    "Block {} of version {} has a uid but no checksum.",
                    block.idx, version.uid
                ))
            })?;
            let idx = block.idx;
            let expected_size = u64::from(block.size);

            read_ex.submit(move || {
                let outcome = (|| -> Result<()> {
                    match depth {
                        ScrubDepth::Metadata => {
                            let meta = storage.read_block_meta(&block_uid)?;
                            let length = storage.read_block_length(&block_uid)?;
                            if length != meta.object_size {
                                return Err(VaultError::Scrubbing(format!(
                                    "Object length {length} differs from recorded object size {}.",
                                    meta.object_size
                                )));
                            }
                            if meta.size != expected_size {
                                return Err(VaultError::Scrubbing(format!(
                                    "Metadata size {} differs from the version's block size {expected_size}.",
                                    meta.size
                                )));
                            }
                            if meta.checksum != checksum {
                                return Err(VaultError::Scrubbing(format!(
                                    "Metadata checksum {} differs from the version's checksum {checksum}.",
                                    meta.checksum
                                )));
                            }
                        }
                        ScrubDepth::Deep => {
                            let (plaintext, meta) = storage.read_block(&block_uid)?;
                            let actual = hash.hexdigest(&plaintext)?;
                            if actual != checksum {
                                return Err(VaultError::Scrubbing(format!(
                                    "Checksum mismatch: expected {checksum}, got {actual}."
                                )));
                            }
                            if meta.checksum != checksum {
                                return Err(VaultError::Scrubbing(format!(
                                    "Metadata checksum {} differs from the version's checksum {checksum}.",
                                    meta.checksum
                                )));
                            }
                        }
                    }
                    Ok(())
                })();
                Ok((idx, outcome.err().map(|e| e.to_string())))
            })?;
        }

        let mut failures = 0u64;
        while let Some(result) = read_ex.completed() {
            let (idx, failure) = result?;
            if let Some(message) = failure {
                failures += 1;
                error!(version = %version.uid, idx, message, "Scrub failure");
            }
        }

        if failures > 0 {
            self.db.set_version_status(&version.uid, VersionStatus::Invalid)?;
            return Err(VaultError::Scrubbing(format!(
                "Scrub of version {} failed: {failures} of {checked_blocks} checked blocks had errors. The version has been marked invalid.",
                version.uid
            )));
        }

        let complete_pass = block_percentage == 100;
        info!(
            version = %version.uid,
            checked = checked_blocks,
            total = total_blocks,
            complete_pass,
            "Scrub passed"
        );
        Ok(ScrubReport {
            version_uid: version.uid.clone(),
            depth,
            total_blocks,
            checked_blocks,
            complete_pass,
        })
    }
}
