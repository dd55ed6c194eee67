//! Error taxonomy for the backup engine.
//!
//! Kinds, not call sites: each variant describes how the failure must be
//! handled, which is what the engines and the CLI dispatch on.
//!
//! | Kind            | Retryable | Effect                                      |
//! |-----------------|-----------|---------------------------------------------|
//! | `Usage`         | no        | reported to the caller                      |
//! | `Configuration` | no        | reported to the caller                      |
//! | `InputData`     | no        | aborts the current operation                |
//! | `AlreadyLocked` | no        | reported; retry only after the lock clears  |
//! | `Scrubbing`     | never     | data-integrity failure; marks versions      |
//! | `Internal`      | never     | invariant violated; terminate the process   |
//! | `ObjectNotFound`| no        | distinct signal from storage removal/reads  |
//! | `Io`/`Storage`  | locally   | storage layer retries with backoff          |
//! | `Database`      | no        | bubbles up unretried                        |
//!
//! Data-integrity failures (metadata HMAC, GCM tag, key-wrap integrity check,
//! block checksum) are always `Scrubbing` and are never retried.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Error, Debug)]
pub enum VaultError {
    /// A caller-supplied argument is invalid (unknown storage name,
    /// malformed URL, removal of a protected version).
    #[error("{0}")]
    Usage(String),

    /// The configuration was rejected by schema validation or is
    /// internally inconsistent.
    #[error("{0}")]
    Configuration(String),

    /// The source IO returned unexpected data, e.g. a short read.
    #[error("{0}")]
    InputData(String),

    /// Acquisition collided on a named lock.
    #[error("Lock {name} is already held by {host} (pid {pid}): {reason}")]
    AlreadyLocked {
        name:   String,
        host:   String,
        pid:    u32,
        reason: String,
    },

    /// A data-integrity mismatch: metadata HMAC, GCM tag, key-wrap
    /// integrity value, or block checksum. Never retried.
    #[error("{0}")]
    Scrubbing(String),

    /// An invariant was violated. The process should terminate.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The storage backend has no object under the requested key.
    /// Distinct from other storage failures so removal of an
    /// already-removed block can be handled gracefully.
    #[error("Storage object {key} not found")]
    ObjectNotFound { key: String },

    /// A storage backend operation failed. Transient by assumption;
    /// the storage layer retries these with exponential backoff.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A transform could not encapsulate or decapsulate a block for a
    /// mechanical reason (bad materials, unsupported parameters).
    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Whether the storage layer may retry the failed operation.
    /// Data-integrity and not-found signals are final; plain IO and
    /// storage failures are assumed transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::Storage(_) | VaultError::Io(_))
    }

    /// Process exit code for the CLI. 0 is success and never produced
    /// here; every error is nonzero.
    pub fn exit_code(&self) -> i32 {
        match self {
            VaultError::Usage(_) => 64,
            VaultError::Configuration(_) => 78,
            VaultError::AlreadyLocked { .. } => 75,
            VaultError::Scrubbing(_) => 65,
            _ => 1,
        }
    }
}
