//! Volume sources and targets.
//!
//! An [`IoSource`] exposes a volume as a sequence of fixed-size blocks.
//! `read_block` returning `None` asserts the region is all zero; the
//! engine trusts that report, records a sparse reference, and never
//! hashes or stores the block. Adapters that cannot detect sparseness
//! simply never return `None`.
//!
//! Sources are selected by URL scheme (`file://...`); the scheme names a
//! configured io module. Only the `file` module is built in.

use std::sync::Arc;

use crate::error::{Result, VaultError};

pub mod file;

// ── IoSource trait ───────────────────────────────────────────────────────────

pub trait IoSource: Send + Sync {
    /// Total bytes of the volume.
    fn size(&self) -> Result<u64>;

    fn block_size(&self) -> u32;

    /// Plaintext of the block at `idx`, or `None` when the region is
    /// known to be all zero. The final block may be short.
    fn read_block(&self, idx: u64) -> Result<Option<Vec<u8>>>;

    /// Write a block at `idx` (restore targets only).
    fn write_block(&self, idx: u64, data: &[u8]) -> Result<()>;

    /// Grow or shrink the target to `size` bytes before a restore.
    /// Sources that cannot be resized (raw devices) verify instead.
    fn resize(&self, size: u64) -> Result<()>;

    /// Indices that changed relative to the volume's previous snapshot,
    /// when the adapter can tell (RBD diff sets). `None` means unknown, and
    /// the engine then reads every block.
    fn changed_blocks(&self) -> Result<Option<Vec<u64>>> {
        Ok(None)
    }

    /// Upper bound on concurrent outstanding reads from this source.
    fn simultaneous_reads(&self) -> usize {
        1
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Split `scheme://rest`. A missing scheme is a usage error; the scheme
/// selects the configured io module.
pub fn parse_url(url: &str) -> Result<(&str, &str)> {
    url.split_once("://").ok_or_else(|| {
        VaultError::Usage(format!(
            "The supplied URL {url} is invalid. You must provide a scheme."
        ))
    })
}

/// Instantiate an io module for `url`. `configuration` is the module's
/// configuration section; `write` opens the volume as a restore target.
pub fn new_io_source(
    module: &str,
    url: &str,
    block_size: u32,
    configuration: serde_yaml::Value,
    write: bool,
) -> Result<Arc<dyn IoSource>> {
    let (_, path) = parse_url(url)?;
    match module {
        "file" => {
            let config: file::FileIoConfig = serde_yaml::from_value(configuration)
                .map_err(|e| {
                    VaultError::Configuration(format!(
                        "Configuration for io {module} is invalid: {e}."
                    ))
                })?;
            Ok(Arc::new(file::FileIoSource::open(path, block_size, config, write)?))
        }
        _ => Err(VaultError::Configuration(format!(
            "IO module {module} is undefined."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_require_a_scheme() {
        assert!(parse_url("/plain/path").is_err());
        assert_eq!(parse_url("file:///tmp/x").unwrap(), ("file", "/tmp/x"));
    }
}
