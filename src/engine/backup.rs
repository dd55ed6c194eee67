//! Backup: enumerate blocks, dedup, transform, store, record.
//!
//! The engine owns two executors: a non-blocking-submit reader (bounded
//! read-ahead) and a blocking-submit writer (bounded in-memory blocks
//! awaiting upload). The coordinating thread is the single writer of the
//! version's database rows; block references are keyed on their index,
//! so completion order never matters.
//!
//! Failure semantics: any source read error, exhausted storage retry, or
//! database error aborts the backup. The version stays `incomplete` and
//! its already-stored objects are left for the GC to reclaim.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use crate::db::VersionCounters;
use crate::dedup::BlockUidHistory;
use crate::engine::{Engine, BLOCK_FLUSH_BATCH};
use crate::error::{Result, VaultError};
use crate::executor::JobExecutor;
use crate::version::{Block, BlockUid, Version, VersionStatus, VersionUid};

/// Read side: `(idx, plaintext or sparse)`.
type ReadResult = (u64, Option<Vec<u8>>);

/// Write side: everything needed to record the reference on completion.
struct WriteResult {
    idx:         u64,
    uid:         BlockUid,
    checksum:    String,
    size:        u32,
    object_size: u64,
}

impl Engine {
    /// Back up `source_url` as a new version of `(volume, snapshot)`.
    /// With `base_version_uid` the new version starts as a clone of the
    /// base and only changed indices are re-read.
    pub fn backup(
        &mut self,
        volume: &str,
        snapshot: &str,
        source_url: &str,
        storage_name: Option<&str>,
        base_version_uid: Option<&VersionUid>,
        labels: BTreeMap<String, String>,
    ) -> Result<VersionUid> {
        let lock_name = format!("version/{volume}/{snapshot}");
        self.acquire_lock(&lock_name, "backup")?;
        let result = self.backup_locked(
            volume,
            snapshot,
            source_url,
            storage_name,
            base_version_uid,
            labels,
        );
        self.release_lock(&lock_name);
        result
    }

    fn backup_locked(
        &mut self,
        volume: &str,
        snapshot: &str,
        source_url: &str,
        storage_name: Option<&str>,
        base_version_uid: Option<&VersionUid>,
        labels: BTreeMap<String, String>,
    ) -> Result<VersionUid> {
        let started = Instant::now();
        let storage = self.storage(storage_name)?;
        let storage_id = storage.storage_id();
        let source = self.io_source(source_url, false)?;
        let block_size = self.config.block_size;

        let source_size = source.size()?;
        let block_count = source_size.div_ceil(u64::from(block_size));
        let tail_size = if block_count == 0 {
            0u32
        } else {
            (source_size - (block_count - 1) * u64::from(block_size)) as u32
        };
        let size_of = |idx: u64| -> u32 {
            if idx + 1 == block_count { tail_size } else { block_size }
        };

        let base = match base_version_uid {
            Some(base_uid) => {
                let base = self.db.version_by_uid(base_uid)?;
                if base.status != VersionStatus::Valid {
                    return Err(VaultError::Usage(format!(
                        "Base version {base_uid} is {}, only valid versions can be differential bases.",
                        base.status.as_str()
                    )));
                }
                if base.block_size != block_size {
                    return Err(VaultError::Usage(format!(
                        "Base version {base_uid} has block size {} but this backup uses {}.",
                        base.block_size, block_size
                    )));
                }
                if base.storage_id != storage_id {
                    return Err(VaultError::Usage(format!(
                        "Base version {base_uid} lives in a different storage."
                    )));
                }
                Some(base)
            }
            None => None,
        };

        let uid = VersionUid::generate();
        let version = Version {
            uid: uid.clone(),
            volume: volume.to_string(),
            snapshot: snapshot.to_string(),
            date: Utc::now(),
            size: block_count * u64::from(block_size),
            block_size,
            storage_id,
            status: VersionStatus::Incomplete,
            protected: false,
            bytes_read: 0,
            bytes_written: 0,
            bytes_deduplicated: 0,
            bytes_sparse: 0,
            duration: 0,
            labels,
        };
        self.db.create_version(&version)?;
        info!(
            version = %uid,
            volume,
            snapshot,
            blocks = block_count,
            differential = base.is_some(),
            "Started backup"
        );

        // Which indices must be read from the source.
        let indices: Vec<u64> = match &base {
            Some(base) => {
                self.db.copy_blocks(&base.uid, &uid)?;
                self.db.trim_blocks(&uid, block_count)?;
                match source.changed_blocks()? {
                    Some(changed) => {
                        let mut set: std::collections::BTreeSet<u64> =
                            changed.into_iter().filter(|&i| i < block_count).collect();
                        // Indices past the base's coverage were never cloned,
                        // and the final block's size may differ from the
                        // base's tail. Both must always be read.
                        for idx in base.block_count().min(block_count)..block_count {
                            set.insert(idx);
                        }
                        if block_count > 0 {
                            set.insert(block_count - 1);
                        }
                        set.into_iter().collect()
                    }
                    None => (0..block_count).collect(),
                }
            }
            None => (0..block_count).collect(),
        };

        let mut read_ex: JobExecutor<ReadResult> =
            JobExecutor::new("backup-read", source.simultaneous_reads(), false);
        let mut write_ex: JobExecutor<WriteResult> =
            JobExecutor::new("backup-write", storage.simultaneous_writes(), true);

        let mut counters = VersionCounters::default();
        let mut history = BlockUidHistory::new();
        let mut rows: Vec<Block> = Vec::new();
        let mut recorded = 0u64;
        let to_read = indices.len() as u64;

        for idx in indices {
            let source = Arc::clone(&source);
            read_ex.submit(move || Ok((idx, source.read_block(idx)?)))?;
        }

        let mut pending_reads = to_read;
        while pending_reads > 0 {
            let (idx, data) = read_ex
                .completed()
                .ok_or_else(|| VaultError::Internal("Read executor ran dry early.".to_string()))??;
            pending_reads -= 1;
            let expected = size_of(idx);

            match data {
                None => {
                    rows.push(Block::sparse(idx, expected));
                    recorded += 1;
                    counters.bytes_sparse += u64::from(expected);
                }
                Some(data) => {
                    if data.len() != expected as usize {
                        return Err(VaultError::InputData(format!(
                            "Block {idx} read {} bytes, expected {expected}.",
                            data.len()
                        )));
                    }
                    counters.bytes_read += data.len() as u64;
                    let digest = self.block_hash.digest(&data)?;
                    let checksum = hex::encode(&digest);
                    let block_uid = BlockUid::from_digest(&digest)?;

                    if let Some((existing_uid, _)) =
                        self.db.block_by_checksum(&checksum, storage_id)?
                    {
                        counters.bytes_deduplicated += data.len() as u64;
                        rows.push(Block {
                            idx,
                            uid: Some(existing_uid),
                            checksum: Some(checksum),
                            size: expected,
                        });
                        recorded += 1;
                        debug!(version = %uid, idx, "Deduplicated against existing block");
                    } else if history.seen(storage_id, block_uid) {
                        // Same content earlier in this run; its write is
                        // already scheduled or done.
                        counters.bytes_deduplicated += data.len() as u64;
                        rows.push(Block {
                            idx,
                            uid: Some(block_uid),
                            checksum: Some(checksum),
                            size: expected,
                        });
                        recorded += 1;
                    } else {
                        history.add(storage_id, block_uid);
                        let storage = Arc::clone(&storage);
                        let size = expected;
                        write_ex.submit(move || {
                            let object_size = storage.save_block(&block_uid, &data, &checksum)?;
                            Ok(WriteResult { idx, uid: block_uid, checksum, size, object_size })
                        })?;
                    }
                }
            }

            while let Some(write) = write_ex.try_completed() {
                let write = write?;
                record_write(&mut rows, &mut counters, write);
                recorded += 1;
            }
            if rows.len() >= BLOCK_FLUSH_BATCH {
                self.db.insert_blocks(&uid, &rows)?;
                rows.clear();
            }
        }

        while write_ex.outstanding() > 0 {
            let write = write_ex
                .completed()
                .ok_or_else(|| VaultError::Internal("Write executor ran dry early.".to_string()))??;
            record_write(&mut rows, &mut counters, write);
            recorded += 1;
            if rows.len() >= BLOCK_FLUSH_BATCH {
                self.db.insert_blocks(&uid, &rows)?;
                rows.clear();
            }
        }
        self.db.insert_blocks(&uid, &rows)?;

        if recorded != to_read {
            return Err(VaultError::Internal(format!(
                "Backup of version {uid} recorded {recorded} of {to_read} scheduled blocks."
            )));
        }

        counters.duration = started.elapsed().as_secs();
        self.db.finalize_version(&uid, &counters)?;
        self.metadata_export(&uid)?;
        info!(
            version = %uid,
            bytes_read = counters.bytes_read,
            bytes_written = counters.bytes_written,
            bytes_deduplicated = counters.bytes_deduplicated,
            bytes_sparse = counters.bytes_sparse,
            duration = counters.duration,
            "Backup is valid"
        );
        Ok(uid)
    }
}

fn record_write(rows: &mut Vec<Block>, counters: &mut VersionCounters, write: WriteResult) {
    counters.bytes_written += write.object_size;
    rows.push(Block {
        idx:      write.idx,
        uid:      Some(write.uid),
        checksum: Some(write.checksum),
        size:     write.size,
    });
}
