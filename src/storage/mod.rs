//! Pluggable block storage.
//!
//! An [`ObjectStore`] is the raw backend capability: put/get/list/delete
//! of byte objects on a flat key space. [`Storage`] wraps one backend
//! with everything every backend shares: the transform chain, the
//! HMAC-sealed metadata sidecar, deterministic key sharding, retry with
//! exponential backoff for transient failures, optional token-bucket
//! bandwidth limits, and the optional read-back consistency check.
//!
//! Backends are selected by module tag from the configuration; only the
//! `file` module is built in. Unknown tags fail at startup, never at
//! block time.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Result, VaultError};
use crate::storage::key::{key_from_path, object_path, BLOCKS_PREFIX, META_SUFFIX, VERSIONS_PREFIX};
use crate::storage::meta::{JsonHmac, ObjectMeta, TransformRecord};
use crate::transform::{derive_key, Transform};
use crate::version::{BlockUid, VersionUid};

pub mod file;
pub mod key;
pub mod meta;

/// Base delay of the exponential write/read backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

// ── ObjectStore trait ────────────────────────────────────────────────────────

/// Raw backend capability. Implementations signal a missing object with
/// [`VaultError::ObjectNotFound`]; every other failure is assumed
/// transient and retried by [`Storage`].
pub trait ObjectStore: Send + Sync {
    fn write_object(&self, key: &str, data: &[u8]) -> Result<()>;
    fn read_object(&self, key: &str) -> Result<Vec<u8>>;
    fn read_object_length(&self, key: &str) -> Result<u64>;
    fn remove_object(&self, key: &str) -> Result<()>;
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
}

// ── Token bucket ─────────────────────────────────────────────────────────────

/// Byte-rate limiter. Callers may take more than one second's budget in
/// a single request (blocks are usually larger); the debt is slept off
/// before the call returns.
struct TokenBucket {
    bytes_per_second: f64,
    state:            std::sync::Mutex<BucketState>,
}

struct BucketState {
    available: f64,
    refilled:  Instant,
}

impl TokenBucket {
    fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second: bytes_per_second as f64,
            state: std::sync::Mutex::new(BucketState {
                available: bytes_per_second as f64,
                refilled:  Instant::now(),
            }),
        }
    }

    fn take(&self, amount: u64) {
        let wait = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let refill = now.duration_since(state.refilled).as_secs_f64() * self.bytes_per_second;
            state.available = (state.available + refill).min(self.bytes_per_second);
            state.refilled = now;
            state.available -= amount as f64;
            if state.available < 0.0 {
                -state.available / self.bytes_per_second
            } else {
                0.0
            }
        };
        if wait > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(wait));
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

/// HMAC key material for the object-metadata seal: either a direct
/// base64 key or the PBKDF2 triple.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HmacConfig {
    #[serde(default)]
    pub key:            Option<String>,
    #[serde(default)]
    pub kdf_salt:       Option<String>,
    #[serde(default)]
    pub kdf_iterations: Option<u32>,
    #[serde(default)]
    pub password:       Option<String>,
}

impl HmacConfig {
    fn resolve(&self) -> Result<Vec<u8>> {
        if let Some(encoded) = &self.key {
            use base64::Engine;
            return base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| VaultError::Configuration("Key hmac.key is not valid base64.".into()));
        }
        match (&self.kdf_salt, self.kdf_iterations, &self.password) {
            (Some(salt), Some(iterations), Some(password)) => {
                use base64::Engine;
                let salt = base64::engine::general_purpose::STANDARD
                    .decode(salt)
                    .map_err(|_| {
                        VaultError::Configuration("Key hmac.kdfSalt is not valid base64.".into())
                    })?;
                Ok(derive_key(&salt, iterations, password, 32))
            }
            _ => Err(VaultError::Configuration(
                "Either hmac.key or all of hmac.kdfSalt, hmac.kdfIterations and hmac.password must be configured."
                    .to_string(),
            )),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_write_retries() -> u32 {
    3
}

fn default_retry_deadline() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FileStorageConfig {
    pub path: std::path::PathBuf,
    pub hmac: HmacConfig,
    #[serde(default = "default_concurrency")]
    pub simultaneous_writes: usize,
    #[serde(default = "default_concurrency")]
    pub simultaneous_reads: usize,
    /// Bytes per second; 0 disables the limit.
    #[serde(default)]
    pub bandwidth_read: u64,
    #[serde(default)]
    pub bandwidth_write: u64,
    #[serde(default)]
    pub consistency_check_writes: bool,
    #[serde(default = "default_write_retries")]
    pub retries: u32,
    /// Total seconds after which a retried operation gives up.
    #[serde(default = "default_retry_deadline")]
    pub retry_deadline: u64,
    /// Names of configured transforms applied at write time, in order.
    #[serde(default)]
    pub active_transforms: Vec<String>,
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Instantiate a storage from its configuration section. The transform
/// registry must already contain every name listed in
/// `activeTransforms`.
pub fn new_storage(
    name: &str,
    storage_id: i64,
    module: &str,
    configuration: serde_yaml::Value,
    transforms: &HashMap<String, Arc<dyn Transform>>,
) -> Result<Storage> {
    match module {
        "file" => {
            let config: FileStorageConfig =
                serde_yaml::from_value(configuration).map_err(|e| {
                    VaultError::Configuration(format!(
                        "Configuration for storage {name} is invalid: {e}."
                    ))
                })?;
            let store = Box::new(file::FileObjectStore::new(&config.path)?);
            Storage::new(name, storage_id, store, config, transforms)
        }
        _ => Err(VaultError::Configuration(format!(
            "Storage module {module} is undefined."
        ))),
    }
}

// ── Storage ──────────────────────────────────────────────────────────────────

pub struct Storage {
    name:       String,
    storage_id: i64,
    store:      Box<dyn ObjectStore>,
    hmac:       JsonHmac,
    /// Write-time transform chain, in write order.
    chain:      Vec<Arc<dyn Transform>>,
    /// Every configured transform, for reading chains recorded by other
    /// (possibly older) configurations.
    registry:   HashMap<String, Arc<dyn Transform>>,
    simultaneous_writes: usize,
    simultaneous_reads:  usize,
    read_throttle:  Option<TokenBucket>,
    write_throttle: Option<TokenBucket>,
    consistency_check_writes: bool,
    retries:        u32,
    retry_deadline: Duration,
}

impl Storage {
    fn new(
        name: &str,
        storage_id: i64,
        store: Box<dyn ObjectStore>,
        config: FileStorageConfig,
        transforms: &HashMap<String, Arc<dyn Transform>>,
    ) -> Result<Self> {
        let mut chain = Vec::with_capacity(config.active_transforms.len());
        for transform_name in &config.active_transforms {
            let transform = transforms.get(transform_name).ok_or_else(|| {
                VaultError::Configuration(format!(
                    "Storage {name} references undefined transform {transform_name}."
                ))
            })?;
            chain.push(Arc::clone(transform));
        }
        Ok(Self {
            name: name.to_string(),
            storage_id,
            store,
            hmac: JsonHmac::new(config.hmac.resolve()?),
            chain,
            registry: transforms.clone(),
            simultaneous_writes: config.simultaneous_writes.max(1),
            simultaneous_reads: config.simultaneous_reads.max(1),
            read_throttle: (config.bandwidth_read > 0).then(|| TokenBucket::new(config.bandwidth_read)),
            write_throttle: (config.bandwidth_write > 0)
                .then(|| TokenBucket::new(config.bandwidth_write)),
            consistency_check_writes: config.consistency_check_writes,
            retries: config.retries,
            retry_deadline: Duration::from_secs(config.retry_deadline),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_id(&self) -> i64 {
        self.storage_id
    }

    /// Upper bound on concurrent outstanding writes to this backend.
    pub fn simultaneous_writes(&self) -> usize {
        self.simultaneous_writes
    }

    /// Upper bound on concurrent outstanding reads from this backend.
    pub fn simultaneous_reads(&self) -> usize {
        self.simultaneous_reads
    }

    /// Retry `operation` with exponential backoff until it succeeds, a
    /// non-transient error occurs, the retry budget is spent, or the
    /// deadline passes. Data-integrity and not-found errors are final.
    fn with_retries<T>(&self, what: &str, operation: impl Fn() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt >= self.retries || started.elapsed() >= self.retry_deadline {
                        return Err(e);
                    }
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
                    warn!(
                        storage = %self.name,
                        %what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient storage error, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn transform_by_name(&self, name: &str, module: &str) -> Result<&Arc<dyn Transform>> {
        let transform = self.registry.get(name).ok_or_else(|| {
            VaultError::Configuration(format!(
                "Block metadata references undefined transform {name}."
            ))
        })?;
        if transform.module() != module {
            return Err(VaultError::Configuration(format!(
                "Transform {name} is module {} but the block was written with module {module}.",
                transform.module()
            )));
        }
        Ok(transform)
    }

    // ── Block objects ────────────────────────────────────────────────────────

    fn block_key(uid: &BlockUid) -> String {
        object_path(BLOCKS_PREFIX, &uid.storage_key())
    }

    /// Encapsulate and store one block. Returns the stored object size.
    pub fn save_block(&self, uid: &BlockUid, plaintext: &[u8], checksum: &str) -> Result<u64> {
        let mut chain = Vec::new();
        let mut data: Cow<'_, [u8]> = Cow::Borrowed(plaintext);
        for transform in &self.chain {
            if let Some((encoded, materials)) = transform.encapsulate(&data)? {
                data = Cow::Owned(encoded);
                chain.push(TransformRecord {
                    name:      transform.name().to_string(),
                    module:    transform.module().to_string(),
                    materials,
                });
            }
        }

        let meta = ObjectMeta {
            size:        plaintext.len() as u64,
            object_size: data.len() as u64,
            checksum:    checksum.to_string(),
            transforms:  chain,
        };
        let sealed = self.hmac.seal_meta(&meta)?;

        let key = Self::block_key(uid);
        let meta_key = format!("{key}{META_SUFFIX}");
        if let Some(throttle) = &self.write_throttle {
            throttle.take((data.len() + sealed.len()) as u64);
        }
        self.with_retries("write_block", || {
            self.store.write_object(&key, &data)?;
            self.store.write_object(&meta_key, &sealed)
        })?;

        if self.consistency_check_writes {
            let written = self.with_retries("consistency_check", || self.store.read_object(&key))?;
            if written != *data {
                return Err(VaultError::Internal(format!(
                    "Consistency check failed for block {uid}: read-back differs from what was written."
                )));
            }
            let written_meta =
                self.with_retries("consistency_check", || self.store.read_object(&meta_key))?;
            if written_meta != sealed {
                return Err(VaultError::Internal(format!(
                    "Consistency check failed for block {uid} metadata."
                )));
            }
        }

        debug!(storage = %self.name, %uid, object_size = data.len(), "Stored block");
        Ok(data.len() as u64)
    }

    /// Verified sidecar metadata of one block.
    pub fn read_block_meta(&self, uid: &BlockUid) -> Result<ObjectMeta> {
        let meta_key = format!("{}{META_SUFFIX}", Self::block_key(uid));
        let raw = self.with_retries("read_block_meta", || self.store.read_object(&meta_key))?;
        self.hmac.open_meta(&raw)
    }

    /// Fetch a block, verify its metadata HMAC and sizes, and reverse
    /// the recorded transform chain.
    pub fn read_block(&self, uid: &BlockUid) -> Result<(Vec<u8>, ObjectMeta)> {
        let meta = self.read_block_meta(uid)?;
        let key = Self::block_key(uid);
        let data = self.with_retries("read_block", || self.store.read_object(&key))?;
        if let Some(throttle) = &self.read_throttle {
            throttle.take(data.len() as u64);
        }
        if data.len() as u64 != meta.object_size {
            return Err(VaultError::Scrubbing(format!(
                "Block {uid} has {} stored bytes but its metadata records {}.",
                data.len(),
                meta.object_size
            )));
        }

        let mut current = data;
        for record in meta.transforms.iter().rev() {
            let transform = self.transform_by_name(&record.name, &record.module)?;
            // The chain and materials are HMAC-verified, so a failing
            // decapsulation means the object bytes are corrupt.
            current = transform
                .decapsulate(&current, &record.materials)
                .map_err(|e| match e {
                    VaultError::Transform(message) => VaultError::Scrubbing(format!(
                        "Block {uid} failed to decapsulate: {message}"
                    )),
                    other => other,
                })?;
        }
        if current.len() as u64 != meta.size {
            return Err(VaultError::Scrubbing(format!(
                "Block {uid} decapsulated to {} bytes but its metadata records {}.",
                current.len(),
                meta.size
            )));
        }
        Ok((current, meta))
    }

    /// Stored (encapsulated) size of a block, without fetching it.
    pub fn read_block_length(&self, uid: &BlockUid) -> Result<u64> {
        let key = Self::block_key(uid);
        self.with_retries("read_block_length", || self.store.read_object_length(&key))
    }

    /// Remove a block and its sidecar. A missing data object surfaces as
    /// [`VaultError::ObjectNotFound`]; a missing sidecar after a present
    /// data object is tolerated.
    pub fn remove_block(&self, uid: &BlockUid) -> Result<()> {
        let key = Self::block_key(uid);
        self.with_retries("remove_block", || self.store.remove_object(&key))?;
        let meta_key = format!("{key}{META_SUFFIX}");
        match self.with_retries("remove_block_meta", || self.store.remove_object(&meta_key)) {
            Ok(()) => Ok(()),
            Err(VaultError::ObjectNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All block uids present in this storage.
    pub fn list_block_uids(&self) -> Result<Vec<BlockUid>> {
        let mut uids = Vec::new();
        for path in self.store.list_objects(BLOCKS_PREFIX)? {
            if path.ends_with(META_SUFFIX) {
                continue;
            }
            uids.push(BlockUid::from_storage_key(&key_from_path(BLOCKS_PREFIX, &path)?)?);
        }
        Ok(uids)
    }

    // ── Version metadata documents ───────────────────────────────────────────

    fn version_key(uid: &VersionUid) -> String {
        object_path(VERSIONS_PREFIX, uid.as_str())
    }

    pub fn write_version_meta(&self, uid: &VersionUid, document: &serde_json::Value) -> Result<()> {
        let sealed = self.hmac.seal_value(document)?;
        if let Some(throttle) = &self.write_throttle {
            throttle.take(sealed.len() as u64);
        }
        let key = Self::version_key(uid);
        self.with_retries("write_version_meta", || self.store.write_object(&key, &sealed))
    }

    pub fn read_version_meta(&self, uid: &VersionUid) -> Result<serde_json::Value> {
        let key = Self::version_key(uid);
        let raw = self.with_retries("read_version_meta", || self.store.read_object(&key))?;
        self.hmac.open_value(&raw)
    }

    pub fn remove_version_meta(&self, uid: &VersionUid) -> Result<()> {
        let key = Self::version_key(uid);
        self.with_retries("remove_version_meta", || self.store.remove_object(&key))
    }

    pub fn list_versions(&self) -> Result<Vec<VersionUid>> {
        let mut uids = Vec::new();
        for path in self.store.list_objects(VERSIONS_PREFIX)? {
            uids.push(VersionUid::new(key_from_path(VERSIONS_PREFIX, &path)?));
        }
        Ok(uids)
    }
}
