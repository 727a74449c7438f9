//! File-backed store: one `<key>.json` file per key inside a directory.
//!
//! Writes go to a sibling temp file and are renamed into place, so a
//! reader never observes a half-written document.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{data_dir, KeyValueStore};
use crate::error::{ConfigError, StorageError};

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `<data_dir>/store`.
    pub fn open_default() -> Result<Self, ConfigError> {
        Ok(Self::new(data_dir()?.join("store")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{EXTENSION}"))
    }

    fn io_err(key: &str, source: std::io::Error) -> StorageError {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_err(key, e))?;

        let target = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.{EXTENSION}.tmp"));
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| Self::io_err(key, e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| Self::io_err(key, e))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Self::io_err("*", e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_err("*", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(EXTENSION) {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| Self::io_err(&path.display().to_string(), e))?;
            }
        }
        Ok(())
    }
}
