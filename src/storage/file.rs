//! Filesystem object store.
//!
//! Keys map directly onto paths below the configured root. Directories
//! are created lazily on the first write into a shard.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};
use crate::storage::ObjectStore;

pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for FileObjectStore {
    fn write_object(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        match fs::write(&path, data) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Ok(fs::write(&path, data)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_object(&self, key: &str) -> Result<Vec<u8>> {
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(VaultError::ObjectNotFound { key: key.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_object_length(&self, key: &str) -> Result<u64> {
        match fs::metadata(self.path_for(key)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(VaultError::ObjectNotFound { key: key.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove_object(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(VaultError::ObjectNotFound { key: key.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.root.join(prefix);
        let mut keys = Vec::new();
        if !base.exists() {
            return Ok(keys);
        }
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    keys.push(relative_key(&self.root, &path)?);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        VaultError::Internal(format!("Path {} escaped the storage root.", path.display()))
    })?;
    let key = relative.to_str().ok_or_else(|| {
        VaultError::Storage(format!("Object path {} is not valid UTF-8.", path.display()))
    })?;
    // Keys always use forward slashes, whatever the platform separator.
    Ok(key.replace(std::path::MAIN_SEPARATOR, "/"))
}
