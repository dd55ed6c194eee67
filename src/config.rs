//! YAML configuration.
//!
//! Top-level shape:
//!
//! ```yaml
//! configurationVersion: '1'
//! blockSize: 4194304
//! hashFunction: blake2b
//! defaultStorage: s1
//! metadataEngine: sqlite:/var/lib/blockvault/meta.sqlite
//! storages:
//!   - name: s1
//!     storageId: 1
//!     module: file
//!     configuration:
//!       path: /var/lib/blockvault/data
//!       hmac:
//!         key: c2VjcmV0LWhtYWMta2V5
//!       activeTransforms:
//!         - z1
//! transforms:
//!   - name: z1
//!     module: zstd
//!     configuration:
//!       level: 3
//! ios:
//!   - name: file
//!     module: file
//! ```
//!
//! Unknown keys are rejected per section; module-specific `configuration`
//! mappings are validated by the owning module's config struct. The
//! `configurationVersion` is semantic and must be `1.x`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, VaultError};

pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;
pub const DEFAULT_HASH_FUNCTION: &str = "blake2b";
pub const DEFAULT_PROCESS_NAME: &str = "blockvault";

/// Supported major version of the configuration format.
const SUPPORTED_MAJOR: u64 = 1;

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_hash_function() -> String {
    DEFAULT_HASH_FUNCTION.to_string()
}

fn default_process_name() -> String {
    DEFAULT_PROCESS_NAME.to_string()
}

// ── Sections ─────────────────────────────────────────────────────────────────

/// Common shape of the pluggable-module lists: a unique instance name, a
/// module tag, and the module's own configuration mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StorageSection {
    pub name:       String,
    pub storage_id: i64,
    pub module:     String,
    #[serde(default)]
    pub configuration: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TransformSection {
    pub name:   String,
    pub module: String,
    #[serde(default)]
    pub configuration: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IoSection {
    pub name:   String,
    pub module: String,
    #[serde(default)]
    pub configuration: Option<serde_yaml::Value>,
}

/// Options consumed by the NBD export front-end. Recognized here so a
/// shared configuration file validates; the engine itself never reads
/// them.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct NbdSection {
    pub cache_directory: PathBuf,
}

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    pub configuration_version: String,
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_hash_function")]
    pub hash_function: String,
    pub default_storage: String,
    pub metadata_engine: String,
    pub storages: Vec<StorageSection>,
    #[serde(default)]
    pub transforms: Vec<TransformSection>,
    #[serde(default)]
    pub ios: Vec<IoSection>,
    #[serde(default)]
    pub nbd: Option<NbdSection>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VaultError::Configuration(format!("Cannot read {}: {e}.", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|e| VaultError::Configuration(format!("Invalid configuration: {e}.")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let major = self
            .configuration_version
            .split('.')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                VaultError::Configuration(format!(
                    "configurationVersion {} is not a semantic version.",
                    self.configuration_version
                ))
            })?;
        if major != SUPPORTED_MAJOR {
            return Err(VaultError::Configuration(format!(
                "configurationVersion {} is unsupported, this build supports {SUPPORTED_MAJOR}.x.",
                self.configuration_version
            )));
        }
        if self.block_size == 0 {
            return Err(VaultError::Configuration("blockSize must be positive.".to_string()));
        }
        if self.storages.is_empty() {
            return Err(VaultError::Configuration(
                "At least one storage must be configured.".to_string(),
            ));
        }
        ensure_unique("storages", self.storages.iter().map(|s| s.name.as_str()))?;
        ensure_unique("transforms", self.transforms.iter().map(|t| t.name.as_str()))?;
        ensure_unique("ios", self.ios.iter().map(|i| i.name.as_str()))?;
        if !self.storages.iter().any(|s| s.name == self.default_storage) {
            return Err(VaultError::Configuration(format!(
                "defaultStorage {} is not a configured storage.",
                self.default_storage
            )));
        }
        Ok(())
    }

    pub fn storage_section(&self, name: &str) -> Result<&StorageSection> {
        self.storages
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| VaultError::Usage(format!("Storage {name} is undefined.")))
    }

    pub fn io_section(&self, name: &str) -> Result<&IoSection> {
        self.ios
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| VaultError::Configuration(format!("IO scheme {name} is undefined.")))
    }
}

/// Missing `configuration:` mappings deserialize per-module as empty.
pub fn section_config(configuration: &Option<serde_yaml::Value>) -> serde_yaml::Value {
    configuration
        .clone()
        .unwrap_or(serde_yaml::Value::Mapping(Default::default()))
}

fn ensure_unique<'a>(list: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(VaultError::Configuration(format!(
                "Duplicate name \"{name}\" in list {list}."
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
configurationVersion: '1'
logFile: /var/log/blockvault.log
blockSize: 4194304
defaultStorage: s1
metadataEngine: sqlite:/var/lib/blockvault/meta.sqlite
storages:
  - name: s1
    storageId: 1
    module: file
    configuration:
      path: /var/lib/blockvault/data
      hmac:
        key: c2VjcmV0
      simultaneousWrites: 5
      simultaneousReads: 5
transforms:
  - name: z1
    module: zstd
    configuration:
      level: 3
ios:
  - name: file
    module: file
    configuration:
      simultaneousReads: 10
"#;

    #[test]
    fn parses_and_applies_defaults() {
        let config = Config::parse(CONFIG).unwrap();
        assert_eq!(config.block_size, 4194304);
        assert_eq!(config.process_name, "blockvault");
        assert_eq!(config.hash_function, "blake2b");
        assert_eq!(config.storages[0].storage_id, 1);
        assert_eq!(config.log_file.as_deref(), Some(Path::new("/var/log/blockvault.log")));
    }

    #[test]
    fn wrong_major_version_is_rejected() {
        let raw = CONFIG.replace("configurationVersion: '1'", "configurationVersion: '112345.0.0'");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn missing_version_is_rejected() {
        assert!(Config::parse("blockSize: 4096").is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = CONFIG.replace("logFile:", "logfileTypo:");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn unknown_default_storage_is_rejected() {
        let raw = CONFIG.replace("defaultStorage: s1", "defaultStorage: nope");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn duplicate_section_names_are_rejected() {
        let raw = CONFIG.replace(
            "ios:\n  - name: file",
            "ios:\n  - name: file\n    module: file\n  - name: file",
        );
        assert!(Config::parse(&raw).is_err());
    }
}
