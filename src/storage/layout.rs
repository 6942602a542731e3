use std::fs;
use std::path::PathBuf;

use crate::core::error::Result;

/// Directory structure for all persisted state.
///
/// ```text
/// <root>/
/// +-- indexes/
/// |   +-- <index>/
/// |       +-- shard_<id>/
/// |           +-- wal/            wal_<seq>.log generations
/// |           +-- partition/      partition snapshot + checkpoint
/// +-- meta/                       FsMetaStore keys
/// ```
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join("indexes"))?;
        fs::create_dir_all(root.join("meta"))?;
        Ok(StorageLayout { root })
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn index_dir(&self, index: &str) -> PathBuf {
        self.root.join("indexes").join(index)
    }

    pub fn shard_dir(&self, index: &str, shard_id: u32) -> PathBuf {
        self.index_dir(index).join(format!("shard_{}", shard_id))
    }

    pub fn wal_dir(&self, index: &str, shard_id: u32) -> PathBuf {
        self.shard_dir(index, shard_id).join("wal")
    }

    pub fn partition_dir(&self, index: &str, shard_id: u32) -> PathBuf {
        self.shard_dir(index, shard_id).join("partition")
    }

    /// Create the shard's directories if missing.
    pub fn ensure_shard_dirs(&self, index: &str, shard_id: u32) -> Result<()> {
        fs::create_dir_all(self.wal_dir(index, shard_id))?;
        fs::create_dir_all(self.partition_dir(index, shard_id))?;
        Ok(())
    }
}
