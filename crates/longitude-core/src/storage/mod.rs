//! Key-value persistence.
//!
//! The core treats storage as a durable, string-keyed store of whole JSON
//! documents. Participant state and the sync queue live under two fixed
//! keys and are always read and written as complete values.

mod config;
pub mod file;
pub mod memory;

pub use config::{Config, StudyConfig, SyncConfig};
pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;

use crate::error::{ConfigError, StorageError};

/// Key holding the serialized [`crate::study::ParticipantState`].
pub const STATE_KEY: &str = "experimentState";

/// Key holding the serialized sync queue array.
pub const QUEUE_KEY: &str = "dataQueue";

/// Durable, process-surviving string-keyed storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every key.
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Read and decode the JSON document under `key`.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StorageError::Corrupt {
            key: key.to_string(),
            source,
        })
}

/// Encode `value` as JSON and write it under `key`.
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value).map_err(|source| StorageError::Serialize {
        key: key.to_string(),
        source,
    })?;
    store.set(key, raw).await
}

/// Returns `~/.config/longitude[-dev]/` based on LONGITUDE_ENV.
///
/// Set LONGITUDE_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("LONGITUDE_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("longitude-dev")
    } else {
        base_dir.join("longitude")
    };

    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::DataDir(e.to_string()))?;
    Ok(dir)
}
