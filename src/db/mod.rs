//! Relational metadata store.
//!
//! SQLite behind a single connection: the engine is single-writer per
//! version and every metadata mutation happens on the coordinating
//! thread, so a pool buys nothing here. Transactions are short by
//! construction: block rows are committed in bounded batches and no
//! transaction ever spans storage I/O.
//!
//! # Schema and migrations
//! Tables: `storages`, `versions`, `blocks`, `labels`, `deleted_blocks`,
//! `locks`. The schema is created and evolved by a forward-only sequence
//! of migrations identified by monotonically assigned revision tokens;
//! applied revisions are recorded in `migrations` and never re-run.
//!
//! # Deferred delete
//! Removing a version inserts its block uids into `deleted_blocks`
//! inside the same transaction that removes the rows, so a crash
//! between removal and the GC sweep leaves the queue correct.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, VaultError};
use crate::version::{Block, BlockUid, Version, VersionStatus, VersionUid};

// ── Migrations ───────────────────────────────────────────────────────────────

/// Forward-only migration sequence. Revision tokens are assigned
/// monotonically and never reused; entries are appended, never edited.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_initial",
        "CREATE TABLE storages (
             id   INTEGER PRIMARY KEY,
             name TEXT NOT NULL UNIQUE
         );
         CREATE TABLE versions (
             uid                TEXT PRIMARY KEY,
             volume             TEXT NOT NULL,
             snapshot           TEXT NOT NULL,
             date               INTEGER NOT NULL,
             size               INTEGER NOT NULL,
             block_size         INTEGER NOT NULL,
             storage_id         INTEGER NOT NULL REFERENCES storages (id),
             status             TEXT NOT NULL,
             protected          INTEGER NOT NULL DEFAULT 0,
             bytes_read         INTEGER NOT NULL DEFAULT 0,
             bytes_written      INTEGER NOT NULL DEFAULT 0,
             bytes_deduplicated INTEGER NOT NULL DEFAULT 0,
             bytes_sparse       INTEGER NOT NULL DEFAULT 0,
             duration           INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX ix_versions_volume ON versions (volume, snapshot);
         CREATE TABLE blocks (
             version_uid TEXT NOT NULL REFERENCES versions (uid) ON DELETE CASCADE,
             idx         INTEGER NOT NULL,
             uid_left    INTEGER,
             uid_right   INTEGER,
             checksum    TEXT,
             size        INTEGER NOT NULL,
             PRIMARY KEY (version_uid, idx)
         );
         CREATE INDEX ix_blocks_uid ON blocks (uid_left, uid_right);
         CREATE INDEX ix_blocks_checksum ON blocks (checksum);
         CREATE TABLE labels (
             version_uid TEXT NOT NULL REFERENCES versions (uid) ON DELETE CASCADE,
             name        TEXT NOT NULL,
             value       TEXT NOT NULL,
             PRIMARY KEY (version_uid, name)
         );",
    ),
    (
        "0002_deleted_blocks",
        "CREATE TABLE deleted_blocks (
             id         INTEGER PRIMARY KEY AUTOINCREMENT,
             storage_id INTEGER NOT NULL,
             uid_left   INTEGER NOT NULL,
             uid_right  INTEGER NOT NULL,
             date       INTEGER NOT NULL
         );
         CREATE INDEX ix_deleted_blocks_storage ON deleted_blocks (storage_id, date);",
    ),
    (
        "0003_locks",
        "CREATE TABLE locks (
             lock_name  TEXT PRIMARY KEY,
             host       TEXT NOT NULL,
             process_id INTEGER NOT NULL,
             reason     TEXT NOT NULL,
             date       INTEGER NOT NULL
         );",
    ),
];

// ── Counters ─────────────────────────────────────────────────────────────────

/// Final accounting written together with the `valid` status flip.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionCounters {
    pub bytes_read:         u64,
    pub bytes_written:      u64,
    pub bytes_deduplicated: u64,
    pub bytes_sparse:       u64,
    pub duration:           u64,
}

/// Result of one GC scan transaction over `deleted_blocks`.
#[derive(Debug, Default)]
pub struct SweepBatch {
    /// Queue rows drained by this scan.
    pub processed: u64,
    /// Drained uids with no live reference left.
    pub removable: Vec<BlockUid>,
}

// ── Database ─────────────────────────────────────────────────────────────────

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (and migrate) the metadata store. `engine` is the
    /// `metadataEngine` configuration value: `sqlite:<path>`, with the
    /// scheme optional for convenience.
    pub fn open(engine: &str) -> Result<Self> {
        let path = engine
            .strip_prefix("sqlite://")
            .or_else(|| engine.strip_prefix("sqlite:"))
            .unwrap_or(engine);
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        conn.pragma_update(None, "busy_timeout", 10_000)?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS migrations (
                 revision TEXT PRIMARY KEY,
                 date     INTEGER NOT NULL
             );",
        )?;
        for (revision, sql) in MIGRATIONS {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT revision FROM migrations WHERE revision = ?1",
                    params![revision],
                    |row| row.get(0),
                )
                .optional()?;
            if applied.is_some() {
                continue;
            }
            let tx = self.conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO migrations (revision, date) VALUES (?1, ?2)",
                params![revision, Utc::now().timestamp()],
            )?;
            tx.commit()?;
            debug!(revision, "Applied database migration");
        }
        Ok(())
    }

    // ── Storages ─────────────────────────────────────────────────────────────

    /// Bind a storage name to its configured id, verifying that neither
    /// side of an existing binding has changed.
    pub fn register_storage(&self, name: &str, storage_id: i64) -> Result<()> {
        let existing: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, name FROM storages WHERE id = ?1 OR name = ?2",
                params![storage_id, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO storages (id, name) VALUES (?1, ?2)",
                    params![storage_id, name],
                )?;
                Ok(())
            }
            Some((id, existing_name)) if id == storage_id && existing_name == name => Ok(()),
            Some((id, existing_name)) => Err(VaultError::Configuration(format!(
                "Storage {name} (id {storage_id}) conflicts with the registered binding {existing_name} (id {id})."
            ))),
        }
    }

    // ── Versions ─────────────────────────────────────────────────────────────

    pub fn create_version(&mut self, version: &Version) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO versions (uid, volume, snapshot, date, size, block_size, storage_id,
                                   status, protected)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                version.uid.as_str(),
                version.volume,
                version.snapshot,
                version.date.timestamp(),
                version.size as i64,
                version.block_size,
                version.storage_id,
                version.status.as_str(),
                version.protected,
            ],
        )?;
        for (name, value) in &version.labels {
            tx.execute(
                "INSERT INTO labels (version_uid, name, value) VALUES (?1, ?2, ?3)",
                params![version.uid.as_str(), name, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn labels_for(&self, uid: &str) -> Result<std::collections::BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM labels WHERE version_uid = ?1")?;
        let rows = stmt.query_map(params![uid], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut labels = std::collections::BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            labels.insert(name, value);
        }
        Ok(labels)
    }

    fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<Version> {
        let date_ts: i64 = row.get(3)?;
        let status: String = row.get(7)?;
        Ok(Version {
            uid: VersionUid::new(row.get::<_, String>(0)?),
            volume: row.get(1)?,
            snapshot: row.get(2)?,
            date: DateTime::<Utc>::from_timestamp(date_ts, 0).unwrap_or_default(),
            size: row.get::<_, i64>(4)? as u64,
            block_size: row.get(5)?,
            storage_id: row.get(6)?,
            status: VersionStatus::parse(&status).unwrap_or(VersionStatus::Invalid),
            protected: row.get(8)?,
            bytes_read: row.get::<_, i64>(9)? as u64,
            bytes_written: row.get::<_, i64>(10)? as u64,
            bytes_deduplicated: row.get::<_, i64>(11)? as u64,
            bytes_sparse: row.get::<_, i64>(12)? as u64,
            duration: row.get::<_, i64>(13)? as u64,
            labels: Default::default(),
        })
    }

    const VERSION_COLUMNS: &'static str = "uid, volume, snapshot, date, size, block_size, \
         storage_id, status, protected, bytes_read, bytes_written, bytes_deduplicated, \
         bytes_sparse, duration";

    pub fn version_by_uid(&self, uid: &VersionUid) -> Result<Version> {
        let mut version = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM versions WHERE uid = ?1",
                    Self::VERSION_COLUMNS
                ),
                params![uid.as_str()],
                Self::row_to_version,
            )
            .optional()?
            .ok_or_else(|| VaultError::Usage(format!("Version {uid} does not exist.")))?;
        version.labels = self.labels_for(uid.as_str())?;
        Ok(version)
    }

    pub fn list_versions(
        &self,
        volume: Option<&str>,
        snapshot: Option<&str>,
    ) -> Result<Vec<Version>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM versions
             WHERE (?1 IS NULL OR volume = ?1) AND (?2 IS NULL OR snapshot = ?2)
             ORDER BY date, uid",
            Self::VERSION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![volume, snapshot], Self::row_to_version)?;
        let mut versions = Vec::new();
        for row in rows {
            let mut version = row?;
            version.labels = self.labels_for(version.uid.as_str())?;
            versions.push(version);
        }
        Ok(versions)
    }

    pub fn set_version_status(&self, uid: &VersionUid, status: VersionStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE versions SET status = ?2 WHERE uid = ?1",
            params![uid.as_str(), status.as_str()],
        )?;
        if changed == 0 {
            return Err(VaultError::Usage(format!("Version {uid} does not exist.")));
        }
        Ok(())
    }

    /// Counter update plus the `incomplete → valid` flip, in one
    /// transaction of its own.
    pub fn finalize_version(&self, uid: &VersionUid, counters: &VersionCounters) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE versions
             SET status = 'valid', bytes_read = ?2, bytes_written = ?3,
                 bytes_deduplicated = ?4, bytes_sparse = ?5, duration = ?6
             WHERE uid = ?1",
            params![
                uid.as_str(),
                counters.bytes_read as i64,
                counters.bytes_written as i64,
                counters.bytes_deduplicated as i64,
                counters.bytes_sparse as i64,
                counters.duration as i64,
            ],
        )?;
        if changed == 0 {
            return Err(VaultError::Internal(format!(
                "Version {uid} vanished before finalization."
            )));
        }
        Ok(())
    }

    pub fn set_version_protected(&self, uid: &VersionUid, protected: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE versions SET protected = ?2 WHERE uid = ?1",
            params![uid.as_str(), protected],
        )?;
        if changed == 0 {
            return Err(VaultError::Usage(format!("Version {uid} does not exist.")));
        }
        Ok(())
    }

    pub fn add_label(&self, uid: &VersionUid, name: &str, value: &str) -> Result<()> {
        // Existence check first so the error is a usage error, not a
        // foreign-key violation.
        self.version_by_uid(uid)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO labels (version_uid, name, value) VALUES (?1, ?2, ?3)",
            params![uid.as_str(), name, value],
        )?;
        Ok(())
    }

    pub fn remove_label(&self, uid: &VersionUid, name: &str) -> Result<()> {
        self.version_by_uid(uid)?;
        self.conn.execute(
            "DELETE FROM labels WHERE version_uid = ?1 AND name = ?2",
            params![uid.as_str(), name],
        )?;
        Ok(())
    }

    // ── Blocks ───────────────────────────────────────────────────────────────

    /// Insert (or overwrite) a batch of block references in one
    /// transaction. Callers bound the batch size; progress committed
    /// here survives a crash with the version still `incomplete`.
    pub fn insert_blocks(&mut self, version_uid: &VersionUid, blocks: &[Block]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO blocks (version_uid, idx, uid_left, uid_right, checksum, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for block in blocks {
                stmt.execute(params![
                    version_uid.as_str(),
                    block.idx as i64,
                    block.uid.map(|u| u.left as i64),
                    block.uid.map(|u| u.right as i64),
                    block.checksum,
                    block.size,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn blocks_by_version(&self, uid: &VersionUid) -> Result<Vec<Block>> {
        let mut stmt = self.conn.prepare(
            "SELECT idx, uid_left, uid_right, checksum, size
             FROM blocks WHERE version_uid = ?1 ORDER BY idx",
        )?;
        let rows = stmt.query_map(params![uid.as_str()], |row| {
            let left: Option<i64> = row.get(1)?;
            let right: Option<i64> = row.get(2)?;
            Ok(Block {
                idx: row.get::<_, i64>(0)? as u64,
                uid: match (left, right) {
                    (Some(l), Some(r)) => Some(BlockUid { left: l as u64, right: r as u64 }),
                    _ => None,
                },
                checksum: row.get(3)?,
                size: row.get(4)?,
            })
        })?;
        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    /// Deduplication lookup: an existing block with this checksum in
    /// this storage. Blocks of invalid versions are not trusted.
    pub fn block_by_checksum(
        &self,
        checksum: &str,
        storage_id: i64,
    ) -> Result<Option<(BlockUid, u32)>> {
        let found = self
            .conn
            .query_row(
                "SELECT b.uid_left, b.uid_right, b.size
                 FROM blocks b JOIN versions v ON b.version_uid = v.uid
                 WHERE b.checksum = ?1 AND v.storage_id = ?2 AND v.status != 'invalid'
                       AND b.uid_left IS NOT NULL
                 LIMIT 1",
                params![checksum, storage_id],
                |row| {
                    Ok((
                        BlockUid {
                            left:  row.get::<_, i64>(0)? as u64,
                            right: row.get::<_, i64>(1)? as u64,
                        },
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(found)
    }

    /// Clone all block references of `from` into `to` (differential
    /// backup seed).
    pub fn copy_blocks(&mut self, from: &VersionUid, to: &VersionUid) -> Result<u64> {
        let copied = self.conn.execute(
            "INSERT INTO blocks (version_uid, idx, uid_left, uid_right, checksum, size)
             SELECT ?2, idx, uid_left, uid_right, checksum, size
             FROM blocks WHERE version_uid = ?1",
            params![from.as_str(), to.as_str()],
        )?;
        Ok(copied as u64)
    }

    /// Drop cloned references at or beyond `block_count` after a
    /// differential clone of a larger base version. The dropped uids are
    /// enqueued for deferred delete like any other dereference.
    pub fn trim_blocks(&mut self, version_uid: &VersionUid, block_count: u64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO deleted_blocks (storage_id, uid_left, uid_right, date)
             SELECT v.storage_id, b.uid_left, b.uid_right, ?3
             FROM blocks b JOIN versions v ON b.version_uid = v.uid
             WHERE b.version_uid = ?1 AND b.idx >= ?2 AND b.uid_left IS NOT NULL",
            params![version_uid.as_str(), block_count as i64, Utc::now().timestamp()],
        )?;
        tx.execute(
            "DELETE FROM blocks WHERE version_uid = ?1 AND idx >= ?2",
            params![version_uid.as_str(), block_count as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a version. The same transaction enqueues every non-sparse
    /// block uid into `deleted_blocks`; the cascade removes the block
    /// and label rows. Returns the number of enqueued uids.
    pub fn remove_version(&mut self, uid: &VersionUid) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let enqueued = tx.execute(
            "INSERT INTO deleted_blocks (storage_id, uid_left, uid_right, date)
             SELECT v.storage_id, b.uid_left, b.uid_right, ?2
             FROM blocks b JOIN versions v ON b.version_uid = v.uid
             WHERE b.version_uid = ?1 AND b.uid_left IS NOT NULL",
            params![uid.as_str(), Utc::now().timestamp()],
        )?;
        let removed = tx.execute("DELETE FROM versions WHERE uid = ?1", params![uid.as_str()])?;
        if removed == 0 {
            return Err(VaultError::Usage(format!("Version {uid} does not exist.")));
        }
        tx.commit()?;
        Ok(enqueued)
    }

    // ── Deferred delete ──────────────────────────────────────────────────────

    /// One GC scan transaction: take a batch of queue entries older than
    /// `cutoff`, drop every taken queue row, and return both the number
    /// of rows drained and the uids that have no live reference left;
    /// those uids are the ones the caller must remove from storage.
    /// Requeued duplicates collapse to one uid. The drained count comes
    /// out of the transaction itself — concurrent removals may enqueue
    /// new rows at any time, so callers must not re-derive it from
    /// point-in-time queue counts.
    pub fn sweep_deleted_blocks(
        &mut self,
        storage_id: i64,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<SweepBatch> {
        let tx = self.conn.transaction()?;
        let candidates: Vec<(i64, BlockUid)> = {
            let mut stmt = tx.prepare(
                "SELECT id, uid_left, uid_right FROM deleted_blocks
                 WHERE storage_id = ?1 AND date <= ?2
                 ORDER BY id LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![storage_id, cutoff.timestamp(), limit as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        BlockUid {
                            left:  row.get::<_, i64>(1)? as u64,
                            right: row.get::<_, i64>(2)? as u64,
                        },
                    ))
                },
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let mut removable = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (queue_id, uid) in &candidates {
            tx.execute("DELETE FROM deleted_blocks WHERE id = ?1", params![queue_id])?;
            if !seen.insert(*uid) {
                continue;
            }
            let live: bool = tx.query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM blocks b JOIN versions v ON b.version_uid = v.uid
                     WHERE v.storage_id = ?1 AND b.uid_left = ?2 AND b.uid_right = ?3
                 )",
                params![storage_id, uid.left as i64, uid.right as i64],
                |row| row.get(0),
            )?;
            if !live {
                removable.push(*uid);
            }
        }
        tx.commit()?;
        Ok(SweepBatch { processed: candidates.len() as u64, removable })
    }

    /// Number of queue entries still pending for a storage.
    pub fn pending_deleted_blocks(&self, storage_id: i64) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM deleted_blocks WHERE storage_id = ?1",
            params![storage_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ── Locks ────────────────────────────────────────────────────────────────

    /// Advisory named lock: acquisition is an INSERT keyed on the lock
    /// name; a duplicate key means somebody else holds it.
    pub fn acquire_lock(&self, name: &str, host: &str, pid: u32, reason: &str) -> Result<()> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO locks (lock_name, host, process_id, reason, date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, host, pid, reason, Utc::now().timestamp()],
        )?;
        if inserted == 1 {
            debug!(lock = name, "Acquired lock");
            return Ok(());
        }
        let holder: Option<(String, u32, String)> = self
            .conn
            .query_row(
                "SELECT host, process_id, reason FROM locks WHERE lock_name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match holder {
            Some((host, pid, reason)) => Err(VaultError::AlreadyLocked {
                name: name.to_string(),
                host,
                pid,
                reason,
            }),
            // The holder released between our insert and the read;
            // treat it as contention all the same.
            None => Err(VaultError::AlreadyLocked {
                name:   name.to_string(),
                host:   String::new(),
                pid:    0,
                reason: String::new(),
            }),
        }
    }

    pub fn release_lock(&self, name: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM locks WHERE lock_name = ?1", params![name])?;
        debug!(lock = name, "Released lock");
        Ok(())
    }
}
