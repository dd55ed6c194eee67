//! Restore: materialize a version into a target volume.
//!
//! Blocks are fetched in completion order; every plaintext is verified
//! against the recorded checksum before it is written. A verification
//! failure is a data-integrity error: the restore aborts and the
//! version is marked `invalid`.

use std::sync::Arc;

use tracing::info;

use crate::engine::Engine;
use crate::error::{Result, VaultError};
use crate::executor::JobExecutor;
use crate::version::{Version, VersionStatus, VersionUid};

impl Engine {
    /// Restore `version_uid` into `target_url`. With `sparse`, blocks
    /// recorded as sparse are skipped instead of written as zeros;
    /// only correct when the target is known zero-initialized.
    /// Restoring a version that is not `valid` requires `force`.
    pub fn restore(
        &mut self,
        version_uid: &VersionUid,
        target_url: &str,
        sparse: bool,
        force: bool,
    ) -> Result<()> {
        let version = self.db.version_by_uid(version_uid)?;
        if version.status != VersionStatus::Valid && !force {
            return Err(VaultError::Usage(format!(
                "Version {version_uid} is {}, restoring it requires force.",
                version.status.as_str()
            )));
        }
        let lock_name = format!("version/{version_uid}");
        self.acquire_lock(&lock_name, "restore")?;
        let result = self.restore_locked(&version, target_url, sparse);
        self.release_lock(&lock_name);
        result
    }

    fn restore_locked(&mut self, version: &Version, target_url: &str, sparse: bool) -> Result<()> {
        let storage = self.storage_by_id(version.storage_id)?;
        let target = self.io_source(target_url, true)?;
        let blocks = self.db.blocks_by_version(&version.uid)?;

        // The version's size is rounded up to the block size; the real
        // extent is the sum of the recorded block sizes.
        let data_size: u64 = blocks.iter().map(|b| u64::from(b.size)).sum();
        target.resize(data_size)?;

        let hash = self.block_hash;
        let mut read_ex: JobExecutor<(u64, Vec<u8>)> =
            JobExecutor::new("restore-read", storage.simultaneous_reads(), false);

        let mut pending = 0u64;
        for block in &blocks {
            match block.uid {
                None => {
                    if !sparse {
                        target.write_block(block.idx, &vec![0u8; block.size as usize])?;
                    }
                }
                Some(block_uid) => {
                    let storage = Arc::clone(&storage);
                    let checksum = block.checksum.clone().ok_or_else(|| {
                        VaultError::Internal(format!(
                            "Block {} of version {} has a uid but no checksum.",
                            block.idx, version.uid
                        ))
                    })?;
                    let idx = block.idx;
                    let expected_size = block.size;
                    read_ex.submit(move || {
                        let (plaintext, _) = storage.read_block(&block_uid)?;
                        if plaintext.len() != expected_size as usize {
                            return Err(VaultError::Scrubbing(format!(
                                "Block {idx} restored {} bytes, the version records {expected_size}.",
                                plaintext.len()
                            )));
                        }
                        let actual = hash.hexdigest(&plaintext)?;
                        if actual != checksum {
                            return Err(VaultError::Scrubbing(format!(
                                "Checksum mismatch for block {idx}: expected {checksum}, got {actual}."
                            )));
                        }
                        Ok((idx, plaintext))
                    })?;
                    pending += 1;
                }
            }
        }

        while pending > 0 {
            let result = read_ex
                .completed()
                .ok_or_else(|| VaultError::Internal("Read executor ran dry early.".to_string()))?;
            pending -= 1;
            match result {
                Ok((idx, plaintext)) => target.write_block(idx, &plaintext)?,
                Err(e @ VaultError::Scrubbing(_)) => {
                    self.db.set_version_status(&version.uid, VersionStatus::Invalid)?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        info!(version = %version.uid, bytes = data_size, "Restore complete");
        Ok(())
    }
}
