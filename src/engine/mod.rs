//! The engine: one value owning the registries and the metadata store.
//!
//! [`Engine::open`] instantiates every configured transform, storage and
//! io module once, registers the storages in the database, and hands out
//! immutable storage handles to the operations. Workers borrow those
//! handles; their lifetime is the engine's.
//!
//! Mutating operations take an advisory database lock named after the
//! entity they touch (`version/<volume>/<snapshot>` for backups,
//! `version/<uid>` for restore/scrub/removal, `storage/<name>` for GC
//! sweeps). Locks carry `(host, pid, reason)`; stale ones are broken by
//! administrator action only, never automatically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{section_config, Config};
use crate::db::Database;
use crate::error::{Result, VaultError};
use crate::hash::{BlockHash, HashAlgorithm};
use crate::io::{new_io_source, parse_url, IoSource};
use crate::storage::{new_storage, Storage};
use crate::transform::{new_transform, Transform};
use crate::version::{Version, VersionMetadata, VersionStatus, VersionUid};

mod backup;
mod cleanup;
mod restore;
mod scrub;

pub use cleanup::CleanupReport;
pub use scrub::{ScrubDepth, ScrubReport};

/// Block rows are flushed to the database in batches of this many, so a
/// crash mid-backup loses at most one batch of progress and the version
/// stays observable as incomplete.
pub(crate) const BLOCK_FLUSH_BATCH: usize = 4096;

pub struct Engine {
    config:     Config,
    db:         Database,
    storages:   HashMap<String, Arc<Storage>>,
    block_hash: BlockHash,
    hostname:   String,
}

impl Engine {
    pub fn open(config: Config) -> Result<Self> {
        let block_hash = BlockHash::new(HashAlgorithm::parse(&config.hash_function)?)?;

        let mut transforms: HashMap<String, Arc<dyn Transform>> = HashMap::new();
        for section in &config.transforms {
            let transform = new_transform(
                &section.name,
                &section.module,
                section_config(&section.configuration),
            )?;
            transforms.insert(section.name.clone(), transform);
        }

        let mut storages = HashMap::new();
        for section in &config.storages {
            let storage = new_storage(
                &section.name,
                section.storage_id,
                &section.module,
                section_config(&section.configuration),
                &transforms,
            )?;
            storages.insert(section.name.clone(), Arc::new(storage));
        }

        let db = Database::open(&config.metadata_engine)?;
        for storage in storages.values() {
            db.register_storage(storage.name(), storage.storage_id())?;
        }

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Ok(Self { config, db, storages, block_hash, hostname })
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    // ── Registries ───────────────────────────────────────────────────────────

    /// Resolve a storage by name, falling back to `defaultStorage`.
    pub fn storage(&self, name: Option<&str>) -> Result<Arc<Storage>> {
        let name = name.unwrap_or(&self.config.default_storage);
        self.storages
            .get(name)
            .cloned()
            .ok_or_else(|| VaultError::Usage(format!("Storage {name} is undefined.")))
    }

    pub(crate) fn storage_by_id(&self, storage_id: i64) -> Result<Arc<Storage>> {
        self.storages
            .values()
            .find(|s| s.storage_id() == storage_id)
            .cloned()
            .ok_or_else(|| {
                VaultError::Configuration(format!(
                    "No configured storage has storage id {storage_id}."
                ))
            })
    }

    /// Instantiate an io module for a volume URL. The URL scheme selects
    /// the configured io section.
    pub(crate) fn io_source(&self, url: &str, write: bool) -> Result<Arc<dyn IoSource>> {
        let (scheme, _) = parse_url(url)?;
        let section = self.config.io_section(scheme)?;
        new_io_source(
            &section.module,
            url,
            self.config.block_size,
            section_config(&section.configuration),
            write,
        )
    }

    // ── Locks ────────────────────────────────────────────────────────────────

    pub(crate) fn acquire_lock(&self, name: &str, reason: &str) -> Result<()> {
        self.db
            .acquire_lock(name, &self.hostname, std::process::id(), reason)
    }

    pub(crate) fn release_lock(&self, name: &str) {
        if let Err(e) = self.db.release_lock(name) {
            warn!(lock = name, error = %e, "Failed to release lock");
        }
    }

    /// Administrator action: drop a stale lock row. Never done
    /// automatically.
    pub fn break_lock(&mut self, name: &str) -> Result<()> {
        warn!(lock = name, "Breaking lock by administrator request");
        self.db.release_lock(name)
    }

    // ── Version bookkeeping ──────────────────────────────────────────────────

    pub fn ls(&self, volume: Option<&str>, snapshot: Option<&str>) -> Result<Vec<Version>> {
        self.db.list_versions(volume, snapshot)
    }

    pub fn version(&self, uid: &VersionUid) -> Result<Version> {
        self.db.version_by_uid(uid)
    }

    /// Remove a version: enqueue its blocks for deferred delete and drop
    /// its exported metadata document. Protected versions refuse;
    /// incomplete versions refuse without `force` because they may
    /// belong to a backup still in flight.
    pub fn rm(&mut self, uid: &VersionUid, force: bool) -> Result<usize> {
        let version = self.db.version_by_uid(uid)?;
        if version.protected {
            return Err(VaultError::Usage(format!(
                "Version {uid} is protected and cannot be removed."
            )));
        }
        if version.status == VersionStatus::Incomplete && !force {
            return Err(VaultError::Usage(format!(
                "Version {uid} is incomplete; a backup may still be running. Use force to remove it anyway."
            )));
        }
        let lock_name = format!("version/{uid}");
        self.acquire_lock(&lock_name, "rm")?;
        let result = self.rm_locked(uid, &version);
        self.release_lock(&lock_name);
        result
    }

    fn rm_locked(&mut self, uid: &VersionUid, version: &Version) -> Result<usize> {
        let storage = self.storage_by_id(version.storage_id)?;
        let enqueued = self.db.remove_version(uid)?;
        match storage.remove_version_meta(uid) {
            Ok(()) | Err(VaultError::ObjectNotFound { .. }) => {}
            Err(e) => {
                warn!(version = %uid, error = %e, "Failed to remove exported version metadata");
            }
        }
        info!(version = %uid, enqueued, "Removed version");
        Ok(enqueued)
    }

    pub fn protect(&mut self, uid: &VersionUid, protected: bool) -> Result<()> {
        self.db.set_version_protected(uid, protected)
    }

    pub fn add_label(&mut self, uid: &VersionUid, name: &str, value: &str) -> Result<()> {
        self.db.add_label(uid, name, value)
    }

    pub fn remove_label(&mut self, uid: &VersionUid, name: &str) -> Result<()> {
        self.db.remove_label(uid, name)
    }

    // ── Version metadata documents ───────────────────────────────────────────

    /// Export a version (row + block references + labels) to its storage
    /// under `versions/<uid>`, sealed with the storage's object HMAC.
    pub fn metadata_export(&self, uid: &VersionUid) -> Result<()> {
        let version = self.db.version_by_uid(uid)?;
        let storage = self.storage_by_id(version.storage_id)?;
        let blocks = self.db.blocks_by_version(uid)?;
        let document = serde_json::to_value(VersionMetadata::new(version, blocks))
            .map_err(|e| VaultError::Internal(format!("Metadata serialization failed: {e}")))?;
        storage.write_version_meta(uid, &document)
    }

    /// Re-create a version from an exported metadata document. Only
    /// HMAC-valid documents are accepted; the version must not already
    /// exist.
    pub fn metadata_import(&mut self, storage_name: Option<&str>, uid: &VersionUid) -> Result<Version> {
        let storage = self.storage(storage_name)?;
        let document = storage.read_version_meta(uid)?;
        let metadata: VersionMetadata = serde_json::from_value(document).map_err(|e| {
            VaultError::InputData(format!("Version metadata document is invalid: {e}."))
        })?;

        let major = metadata.metadata_version.split('.').next().unwrap_or("");
        if major != "1" {
            return Err(VaultError::InputData(format!(
                "Unsupported metadata version {}.",
                metadata.metadata_version
            )));
        }
        if metadata.version.uid != *uid {
            return Err(VaultError::InputData(format!(
                "Document at versions/{uid} describes version {}.",
                metadata.version.uid
            )));
        }
        if metadata.version.storage_id != storage.storage_id() {
            return Err(VaultError::InputData(format!(
                "Version {uid} belongs to storage id {} but was imported from storage id {}.",
                metadata.version.storage_id,
                storage.storage_id()
            )));
        }
        if self.db.version_by_uid(uid).is_ok() {
            return Err(VaultError::Usage(format!("Version {uid} already exists.")));
        }

        self.db.create_version(&metadata.version)?;
        for chunk in metadata.blocks.chunks(BLOCK_FLUSH_BATCH) {
            self.db.insert_blocks(uid, chunk)?;
        }
        info!(version = %uid, blocks = metadata.blocks.len(), "Imported version metadata");
        Ok(metadata.version)
    }

    /// Labels supplied as `name=value` pairs on the command line.
    pub fn parse_labels(pairs: &[String]) -> Result<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        for pair in pairs {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                VaultError::Usage(format!("Label {pair} is not of the form name=value."))
            })?;
            if labels.insert(name.to_string(), value.to_string()).is_some() {
                return Err(VaultError::Usage(format!("Label {name} was given twice.")));
            }
        }
        Ok(labels)
    }
}
