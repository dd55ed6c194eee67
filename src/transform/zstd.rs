//! Zstandard block compression.
//!
//! Declines (returns `None`) whenever compression would not shrink the
//! block, so incompressible data is stored verbatim and the recorded
//! chain stays empty for it. `materials` carries the original size so
//! decapsulation can bound its output buffer.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Result, VaultError};
use crate::transform::{materials_u64, Materials, Transform};

pub const MODULE: &str = "zstd";

/// Inclusive compression-level bounds accepted by the `level` option.
pub const MIN_LEVEL: i32 = 1;
pub const MAX_LEVEL: i32 = 22;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ZstdConfig {
    pub level: i32,
    /// Optional shared dictionary, loaded once at startup. Must be the
    /// same file for every process reading the affected blocks.
    #[serde(default)]
    pub dict_data_file: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ZstdTransform {
    name:       String,
    level:      i32,
    dictionary: Option<Vec<u8>>,
}

impl ZstdTransform {
    pub fn new(name: &str, config: ZstdConfig) -> Result<Self> {
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&config.level) {
            return Err(VaultError::Configuration(format!(
                "Option level must be between {MIN_LEVEL} and {MAX_LEVEL} (inclusive), got {}.",
                config.level
            )));
        }
        let dictionary = match &config.dict_data_file {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                VaultError::Configuration(format!(
                    "Cannot read dictDataFile {}: {e}.",
                    path.display()
                ))
            })?),
            None => None,
        };
        Ok(Self { name: name.to_string(), level: config.level, dictionary })
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut compressor = match &self.dictionary {
            Some(dict) => zstd::bulk::Compressor::with_dictionary(self.level, dict),
            None => zstd::bulk::Compressor::new(self.level),
        }
        .map_err(|e| VaultError::Transform(format!("Zstd compressor setup failed: {e}.")))?;
        compressor
            .compress(data)
            .map_err(|e| VaultError::Transform(format!("Zstd compression failed: {e}.")))
    }

    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        let mut decompressor = match &self.dictionary {
            Some(dict) => zstd::bulk::Decompressor::with_dictionary(dict),
            None => zstd::bulk::Decompressor::new(),
        }
        .map_err(|e| VaultError::Transform(format!("Zstd decompressor setup failed: {e}.")))?;
        decompressor
            .decompress(data, original_size)
            .map_err(|e| VaultError::Transform(format!("Zstd decompression failed: {e}.")))
    }
}

impl Transform for ZstdTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn encapsulate(&self, data: &[u8]) -> Result<Option<(Vec<u8>, Materials)>> {
        let compressed = self.compress(data)?;
        if compressed.len() >= data.len() {
            // Not smaller, so the engine stores the block uncompressed.
            return Ok(None);
        }
        let mut materials = Materials::new();
        materials.insert(
            "original_size".to_string(),
            serde_json::Value::from(data.len() as u64),
        );
        Ok(Some((compressed, materials)))
    }

    fn decapsulate(&self, data: &[u8], materials: &Materials) -> Result<Vec<u8>> {
        let original_size = materials_u64(materials, "original_size")?;
        let plaintext = self.decompress(data, original_size as usize)?;
        if plaintext.len() as u64 != original_size {
            return Err(VaultError::Scrubbing(format!(
                "Decompressed size {} does not match recorded original_size {}.",
                plaintext.len(),
                original_size
            )));
        }
        Ok(plaintext)
    }
}
