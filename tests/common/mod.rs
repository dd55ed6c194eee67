//! Shared fixture: a complete engine wired to temporary directories.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use blockvault::{Config, Engine};
use tempfile::TempDir;

pub const BLOCK_SIZE: usize = 4096;

pub struct TestVault {
    pub dir:    TempDir,
    pub engine: Engine,
    yaml:       String,
}

impl TestVault {
    /// Engine with the default transform chain: zstd then AES-256-GCM.
    pub fn new() -> Self {
        Self::with_active_transforms(&["z1", "enc1"])
    }

    pub fn with_active_transforms(active: &[&str]) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().display().to_string();
        let active_yaml = active
            .iter()
            .map(|name| format!("        - {name}"))
            .collect::<Vec<_>>()
            .join("\n");
        let hmac_key = BASE64.encode(b"integration-test-hmac-key");
        let master_key = BASE64.encode([0x11u8; 32]);
        let yaml = format!(
            r#"
configurationVersion: '1'
blockSize: {BLOCK_SIZE}
defaultStorage: s1
metadataEngine: sqlite:{root}/meta.sqlite
storages:
  - name: s1
    storageId: 1
    module: file
    configuration:
      path: {root}/objects
      hmac:
        key: {hmac_key}
      simultaneousWrites: 4
      simultaneousReads: 4
      activeTransforms:
{active_yaml}
transforms:
  - name: z1
    module: zstd
    configuration:
      level: 1
  - name: enc1
    module: aes_256_gcm
    configuration:
      masterKey: {master_key}
ios:
  - name: file
    module: file
    configuration:
      simultaneousReads: 4
"#
        );
        let engine = Engine::open(Config::parse(&yaml).expect("config")).expect("engine");
        Self { dir, engine, yaml }
    }

    /// A second engine over the same configuration (same database, same
    /// storage), as another process would open it.
    pub fn second_engine(&self) -> Engine {
        Engine::open(Config::parse(&self.yaml).expect("config")).expect("engine")
    }

    /// Path of the metadata database, for direct inspection.
    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("meta.sqlite")
    }

    /// Write a source image and return its URL.
    pub fn write_source(&self, name: &str, data: &[u8]) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, data).expect("write source");
        format!("file://{}", path.display())
    }

    pub fn target_url(&self, name: &str) -> (String, PathBuf) {
        let path = self.dir.path().join(name);
        (format!("file://{}", path.display()), path)
    }

    /// Every stored block object (sidecars excluded).
    pub fn stored_block_objects(&self) -> Vec<PathBuf> {
        let mut objects = Vec::new();
        let base = self.dir.path().join("objects").join("blocks");
        if base.exists() {
            collect_files(&base, &mut objects);
        }
        objects.retain(|p| p.extension().map(|e| e != "meta").unwrap_or(true));
        objects.sort();
        objects
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in std::fs::read_dir(dir).expect("read_dir") {
        let path = entry.expect("entry").path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

/// Deterministic high-entropy bytes (incompressible, seed-stable).
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect()
}
