//! GC sweep: apply the deferred-delete queue.
//!
//! Version removal only enqueues block uids. This sweep processes queue
//! entries older than the safety delay: each scan transaction takes a
//! batch, drops the queue rows, and yields the uids with no live
//! reference left; those objects are then removed from storage. The
//! safety delay closes the race with a concurrent backup that consulted
//! the `blocks` table just before the sweep and decided to re-use a
//! still-present object.

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{Result, VaultError};

/// Queue entries processed per scan transaction.
const SWEEP_BATCH: usize = 1000;

#[derive(Debug, Default, Serialize)]
pub struct CleanupReport {
    /// Objects physically removed from storage.
    pub removed_blocks: u64,
    /// Queue entries dropped because a live reference re-appeared.
    pub requeued_references: u64,
    /// Queue entries whose object was already gone.
    pub missing_objects: u64,
}

impl Engine {
    /// Process the deferred-delete queue of every configured storage.
    /// Only entries older than `safety_delay_seconds` are considered.
    pub fn cleanup(&mut self, safety_delay_seconds: u64) -> Result<CleanupReport> {
        let cutoff = Utc::now()
            - Duration::seconds(i64::try_from(safety_delay_seconds).map_err(|_| {
                VaultError::Usage("safety delay is out of range.".to_string())
            })?);

        let mut storage_names: Vec<String> = self.storages.keys().cloned().collect();
        storage_names.sort();

        let mut report = CleanupReport::default();
        for name in storage_names {
            let lock_name = format!("storage/{name}");
            self.acquire_lock(&lock_name, "cleanup")?;
            let result = self.cleanup_storage(&name, cutoff, &mut report);
            self.release_lock(&lock_name);
            result?;
        }
        info!(
            removed = report.removed_blocks,
            requeued = report.requeued_references,
            missing = report.missing_objects,
            "Cleanup complete"
        );
        Ok(report)
    }

    fn cleanup_storage(
        &mut self,
        name: &str,
        cutoff: chrono::DateTime<Utc>,
        report: &mut CleanupReport,
    ) -> Result<()> {
        let storage = self.storage(Some(name))?;
        let storage_id = storage.storage_id();
        loop {
            let batch = self
                .db
                .sweep_deleted_blocks(storage_id, cutoff, SWEEP_BATCH)?;
            if batch.processed == 0 {
                // Everything left is younger than the safety delay.
                break;
            }
            report.requeued_references += batch.processed - batch.removable.len() as u64;

            for uid in batch.removable {
                match storage.remove_block(&uid) {
                    Ok(()) => report.removed_blocks += 1,
                    Err(VaultError::ObjectNotFound { .. }) => {
                        report.missing_objects += 1;
                        warn!(storage = name, %uid, "Unreferenced block was already gone");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
