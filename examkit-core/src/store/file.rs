//! File-backed expiring store.
//!
//! Entries live in a single JSON document. The CLI keeps it at
//! `<data_dir>/session.json`, `~/.local/share/examkit/` on Linux.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{SecretStore, StoreError, StoredEntry};

/// On-disk document layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileStoreData {
    /// Version of the document format (for future migrations).
    version: u32,

    entries: HashMap<String, StoredEntry>,
}

impl Default for FileStoreData {
    fn default() -> Self {
        Self {
            version: 1,
            entries: HashMap::new(),
        }
    }
}

/// Disk-backed store that survives restarts.
///
/// The document is read once on open and cached; every mutation rewrites
/// the whole file through a temporary file and a rename, so a crash never
/// leaves a half-written session behind.
pub struct FileStore {
    path: PathBuf,
    data: RwLock<FileStoreData>,
}

impl FileStore {
    /// Open the store at `path`, creating parent directories as needed.
    ///
    /// Entries that already expired are dropped while loading.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut data = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str::<FileStoreData>(&contents)?
        } else {
            FileStoreData::default()
        };

        let now = Utc::now();
        data.entries.retain(|_, entry| !entry.is_expired_at(now));

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Get the storage path for this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &FileStoreData) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");

        // A leftover temp file keeps its old mode; start from a fresh one.
        match fs::remove_file(&tmp) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("keys_count", &self.data.read().entries.len())
            .finish()
    }
}

#[async_trait]
impl SecretStore for FileStore {
    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let data = self.data.read();
        Ok(data
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .cloned())
    }

    async fn put(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        let mut data = self.data.write();
        data.entries.insert(key.to_string(), entry);
        let now = Utc::now();
        data.entries.retain(|_, entry| !entry.is_expired_at(now));
        self.save(&data)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.write();
        if data.entries.remove(key).is_none() {
            return Ok(());
        }
        self.save(&data)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let data = self.data.read();
        Ok(data
            .entries
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && !entry.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
