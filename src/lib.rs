//! # blockvault: block-level deduplicating backup engine
//!
//! Engine guarantees:
//! - Every stored block is content-addressed: its uid derives from the
//!   unsalted digest of its plaintext, so identical content is stored
//!   exactly once per storage backend across all versions and volumes
//! - All-zero blocks are never stored; a version records them as sparse
//!   references and restore rewrites them as zeros
//! - Blocks are compressed and encrypted per block with fresh envelope
//!   keys; the database uid and checksum stay stable across re-uploads
//! - Every stored object carries HMAC-sealed metadata; the seal is
//!   verified before any field is used, and integrity failures are never
//!   retried
//! - A version is observable as `valid` only after every block reference
//!   is committed; anything interrupted stays `incomplete`
//! - Version removal never deletes storage objects directly; uids pass
//!   through a deferred-delete queue and a safety delay before the GC
//!   sweep removes unreferenced objects

pub mod config;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hash;
pub mod io;
pub mod storage;
pub mod transform;
pub mod version;

// Flat re-exports for the most common types.
pub use config::Config;
pub use engine::{CleanupReport, Engine, ScrubDepth, ScrubReport};
pub use error::{Result, VaultError};
pub use hash::{BlockHash, HashAlgorithm};
pub use version::{Block, BlockUid, Version, VersionStatus, VersionUid};
