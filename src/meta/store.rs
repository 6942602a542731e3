use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{Error, ErrorKind, Result};

/// Versioned metadata value. Versions bump on every put; last writer wins
/// per key, no cross-key transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaValue {
    pub version: u64,
    pub data: Value,
}

/// Cluster-visible key-value store for index definitions, mappings and
/// lifecycle state. Keys are slash-separated paths like
/// `index/{name}/settings`. A distributed backend must satisfy the same
/// contract; `create_if_absent` is the only atomicity it requires.
pub trait MetaStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<MetaValue>>;

    /// Unconditional write; bumps the stored version.
    fn put(&self, key: &str, data: Value) -> Result<()>;

    /// Atomic create. Returns false (and writes nothing) if the key exists.
    fn create_if_absent(&self, key: &str, data: Value) -> Result<bool>;

    /// All entries whose key starts with `prefix`, key-ordered.
    fn list(&self, prefix: &str) -> Result<Vec<(String, MetaValue)>>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// In-process store for tests and embedded single-node use.
#[derive(Default)]
pub struct MemoryMetaStore {
    entries: RwLock<BTreeMap<String, MetaValue>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMetaStore {
    fn get(&self, key: &str) -> Result<Option<MetaValue>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, data: Value) -> Result<()> {
        let mut entries = self.entries.write();
        let version = entries.get(key).map(|v| v.version + 1).unwrap_or(1);
        entries.insert(key.to_string(), MetaValue { version, data });
        Ok(())
    }

    fn create_if_absent(&self, key: &str, data: Value) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), MetaValue { version: 1, data });
        Ok(true)
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, MetaValue)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Filesystem-backed store: one JSON file per key under a root directory.
/// `create_if_absent` leans on `O_EXCL` file creation; puts go through a
/// temp file and rename.
pub struct FsMetaStore {
    root: PathBuf,
    // Serializes read-modify-write of the version counter in-process.
    write_lock: Mutex<()>,
}

impl FsMetaStore {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(FsMetaStore {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.split('/').any(|part| {
                part.is_empty() || part == "." || part == ".." || part.contains('\\')
            })
        {
            return Err(Error::validation(format!("invalid metadata key {:?}", key)));
        }
        Ok(self.root.join(format!("{}.json", key)))
    }

    fn read_value(path: &Path) -> Result<MetaValue> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn write_value(&self, path: &Path, value: &MetaValue) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(value)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&raw)?;
        // Sync before the rename; a crash must never replace a good
        // value with a truncated one.
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl MetaStore for FsMetaStore {
    fn get(&self, key: &str) -> Result<Option<MetaValue>> {
        let path = self.key_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_value(&path)?))
    }

    fn put(&self, key: &str, data: Value) -> Result<()> {
        let path = self.key_path(key)?;
        let _guard = self.write_lock.lock();
        let version = if path.exists() {
            Self::read_value(&path)?.version + 1
        } else {
            1
        };
        self.write_value(&path, &MetaValue { version, data })
    }

    fn create_if_absent(&self, key: &str, data: Value) -> Result<bool> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = self.write_lock.lock();
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let raw = serde_json::to_vec_pretty(&MetaValue { version: 1, data })?;
        file.write_all(&raw)?;
        file.sync_all()?;
        Ok(true)
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, MetaValue)>> {
        let mut entries = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    let key = path
                        .with_extension("")
                        .strip_prefix(&self.root)
                        .map_err(|e| Error::internal(e.to_string()))?
                        .to_string_lossy()
                        .replace('\\', "/");
                    if key.starts_with(prefix) {
                        entries.push((key, Self::read_value(&path)?));
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::new(
                ErrorKind::Io,
                format!("delete {}: {}", key, e),
            )),
        }
    }
}
