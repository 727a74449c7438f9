//! Send-permission accessors consulted by every drain.
//!
//! Decouples the queue from the state machine: the tracker implements
//! [`SyncGate`] over the persisted participant state.

use async_trait::async_trait;

use crate::error::StorageError;

#[async_trait]
pub trait SyncGate: Send + Sync {
    /// Consent to send. Only `Some(false)` stops a drain.
    async fn send_enabled(&self) -> Result<Option<bool>, StorageError>;

    /// Ignore send-after embargoes.
    async fn force_send(&self) -> Result<bool, StorageError>;
}

/// Gate with fixed answers.
#[derive(Debug, Clone, Copy)]
pub struct StaticGate {
    pub send_enabled: Option<bool>,
    pub force: bool,
}

impl Default for StaticGate {
    fn default() -> Self {
        Self {
            send_enabled: Some(true),
            force: false,
        }
    }
}

#[async_trait]
impl SyncGate for StaticGate {
    async fn send_enabled(&self) -> Result<Option<bool>, StorageError> {
        Ok(self.send_enabled)
    }

    async fn force_send(&self) -> Result<bool, StorageError> {
        Ok(self.force)
    }
}
