//! File-backed volume adapter.
//!
//! Reads and writes fixed-size blocks of a regular file (or image file)
//! via positioned IO, so one handle serves all worker threads. Sparse
//! detection is zero-detection: a block whose bytes are all zero is
//! reported sparse. That is truthful: the engine only needs "this
//! region reads as zeros", not filesystem hole information.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, VaultError};
use crate::io::IoSource;

fn default_simultaneous_reads() -> usize {
    1
}

fn default_sparse_detection() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FileIoConfig {
    #[serde(default = "default_simultaneous_reads")]
    pub simultaneous_reads: usize,
    /// Report all-zero blocks as sparse. Disable to force storage of
    /// zero blocks.
    #[serde(default = "default_sparse_detection")]
    pub sparse_detection: bool,
}

impl Default for FileIoConfig {
    fn default() -> Self {
        Self {
            simultaneous_reads: default_simultaneous_reads(),
            sparse_detection:   default_sparse_detection(),
        }
    }
}

pub struct FileIoSource {
    path:               PathBuf,
    file:               File,
    block_size:         u32,
    simultaneous_reads: usize,
    sparse_detection:   bool,
    writable:           bool,
}

impl FileIoSource {
    pub fn open(
        path: impl AsRef<Path>,
        block_size: u32,
        config: FileIoConfig,
        write: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if write {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
        } else {
            File::open(&path)
        }
        .map_err(|e| VaultError::Usage(format!("Cannot open {}: {e}.", path.display())))?;
        Ok(Self {
            path,
            file,
            block_size,
            simultaneous_reads: config.simultaneous_reads.max(1),
            sparse_detection: config.sparse_detection,
            writable: write,
        })
    }
}

impl IoSource for FileIoSource {
    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_block(&self, idx: u64) -> Result<Option<Vec<u8>>> {
        let offset = idx * u64::from(self.block_size);
        let total = self.size()?;
        if offset >= total {
            return Err(VaultError::InputData(format!(
                "Block {idx} starts beyond the end of {}.",
                self.path.display()
            )));
        }
        let want = usize::try_from((total - offset).min(u64::from(self.block_size)))
            .map_err(|_| VaultError::Internal("Block size overflows usize.".to_string()))?;
        let mut buffer = vec![0u8; want];
        self.file.read_exact_at(&mut buffer, offset).map_err(|e| {
            VaultError::InputData(format!(
                "Short read of block {idx} from {}: {e}.",
                self.path.display()
            ))
        })?;
        if self.sparse_detection && buffer.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        Ok(Some(buffer))
    }

    fn write_block(&self, idx: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VaultError::Usage(format!(
                "{} was opened read-only.",
                self.path.display()
            )));
        }
        let offset = idx * u64::from(self.block_size);
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn resize(&self, size: u64) -> Result<()> {
        if !self.writable {
            return Err(VaultError::Usage(format!(
                "{} was opened read-only.",
                self.path.display()
            )));
        }
        self.file.set_len(size)?;
        Ok(())
    }

    fn simultaneous_reads(&self) -> usize {
        self.simultaneous_reads
    }
}
