//! Durable sync queue.
//!
//! Payloads are persisted under the `dataQueue` key before any delivery is
//! attempted, so nothing is lost to a crash or a dead network. Items are
//! kept in insertion order and delivered oldest first.
//!
//! ## Concurrency
//!
//! - `drain()` is reentrant-safe: the running pass is memoized as a shared
//!   future and late callers await the same outcome. The memo clears itself
//!   when the pass resolves.
//! - Every read-modify-write of the queue record holds `list_lock`. The
//!   drain never holds it across a transport call.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::gate::{StaticGate, SyncGate};
use super::transport::{AlwaysOnline, Connectivity, Delivery, Transport};
use super::types::{DrainOutcome, DrainTally, QueueItem, SyncStatus};
use crate::clock::{Clock, SystemClock};
use crate::error::StorageError;
use crate::storage::{load_json, save_json, KeyValueStore, SyncConfig, QUEUE_KEY};

type DrainFuture = Shared<BoxFuture<'static, DrainOutcome>>;

/// Handle to the queue. Clones share one queue.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn Connectivity>,
    gate: Arc<dyn SyncGate>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    list_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<DrainFuture>>,
    history: Mutex<DrainHistory>,
}

#[derive(Default)]
struct DrainHistory {
    last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    last_outcome: Option<DrainOutcome>,
}

/// Builder for [`SyncQueue`].
pub struct SyncQueueBuilder {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn Connectivity>,
    gate: Arc<dyn SyncGate>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncQueueBuilder {
    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Source of the send-enabled and force-send flags.
    pub fn gate(mut self, gate: Arc<dyn SyncGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SyncQueue {
        SyncQueue {
            inner: Arc::new(Inner {
                store: self.store,
                transport: self.transport,
                connectivity: self.connectivity,
                gate: self.gate,
                clock: self.clock,
                config: self.config,
                list_lock: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(None),
                history: Mutex::new(DrainHistory::default()),
            }),
        }
    }
}

impl SyncQueue {
    /// Queue over `store` delivering through `transport`.
    ///
    /// Defaults: always online, sending enabled, system clock, default
    /// [`SyncConfig`].
    pub fn builder(store: Arc<dyn KeyValueStore>, transport: Arc<dyn Transport>) -> SyncQueueBuilder {
        SyncQueueBuilder {
            store,
            transport,
            connectivity: Arc::new(AlwaysOnline),
            gate: Arc::new(StaticGate::default()),
            clock: Arc::new(SystemClock),
            config: SyncConfig::default(),
        }
    }

    /// Persist `item`, replacing any queued item with the same name, then
    /// start a background drain.
    ///
    /// Only storage failures are returned. Delivery problems stay in the
    /// queue and show up in [`SyncQueue::status`].
    pub async fn enqueue(&self, item: QueueItem) -> Result<(), StorageError> {
        let name = item.name.clone();
        let pending = {
            let _guard = self.inner.list_lock.lock().await;
            let mut items = self.inner.load_items().await?;
            match items.iter_mut().find(|queued| queued.name == item.name) {
                Some(existing) => *existing = item,
                None => items.push(item),
            }
            self.inner.save_items(&items).await?;
            items.len()
        };
        debug!(name = %name, pending, "Queued item for sync");

        if self.inner.config.drain_on_enqueue {
            self.spawn_drain();
        }
        Ok(())
    }

    fn spawn_drain(&self) -> Option<JoinHandle<DrainOutcome>> {
        match Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                Some(handle.spawn(async move { queue.drain().await }))
            }
            Err(_) => {
                debug!("No async runtime; background drain skipped");
                None
            }
        }
    }

    /// Attempt delivery of the whole queue.
    ///
    /// Joins the running pass if there is one.
    pub async fn drain(&self) -> DrainOutcome {
        let pass = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some(running) => {
                    debug!("Joining in-flight drain");
                    running.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let pass = async move {
                        let outcome = inner.drain_pass().await;
                        inner.finish(&outcome);
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pass.clone());
                    pass
                }
            }
        };
        pass.await
    }

    pub async fn has_pending(&self) -> Result<bool, StorageError> {
        Ok(!self.inner.load_items().await?.is_empty())
    }

    /// Queued items, oldest first.
    pub async fn pending(&self) -> Result<Vec<QueueItem>, StorageError> {
        self.inner.load_items().await
    }

    /// Drop every queued item.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.inner.list_lock.lock().await;
        self.inner.store.remove(QUEUE_KEY).await?;
        info!("Sync queue cleared");
        Ok(())
    }

    pub async fn status(&self) -> Result<SyncStatus, StorageError> {
        let pending_count = self.inner.load_items().await?.len();
        let in_progress = lock(&self.inner.in_flight).is_some();
        let history = lock(&self.inner.history);
        Ok(SyncStatus {
            last_sync_at: history.last_sync_at,
            pending_count,
            in_progress,
            last_outcome: history.last_outcome.clone(),
        })
    }

    /// Network state changed. Coming back online retries after
    /// `reconnect_delay_ms`.
    pub fn notify_connectivity(&self, online: bool) -> Option<JoinHandle<DrainOutcome>> {
        if !online {
            debug!("Connectivity lost");
            return None;
        }
        let handle = Handle::try_current().ok()?;
        let queue = self.clone();
        let delay = self.inner.config.reconnect_delay();
        info!(delay_ms = self.inner.config.reconnect_delay_ms, "Connectivity restored, scheduling drain");
        Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            queue.drain().await
        }))
    }

    /// Follow a connectivity channel until its sender is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch_connectivity(&self, mut online: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                if let Some(retry) = queue.notify_connectivity(is_online) {
                    if let Err(e) = retry.await {
                        warn!(error = %e, "Reconnect drain task failed");
                    }
                }
            }
            debug!("Connectivity channel closed");
        })
    }
}

enum Halt {
    Paused,
    Rejected {
        name: String,
        status: u16,
        response: String,
    },
}

impl Inner {
    async fn load_items(&self) -> Result<Vec<QueueItem>, StorageError> {
        Ok(load_json::<Vec<QueueItem>>(self.store.as_ref(), QUEUE_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save_items(&self, items: &[QueueItem]) -> Result<(), StorageError> {
        save_json(self.store.as_ref(), QUEUE_KEY, items).await
    }

    async fn drain_pass(&self) -> DrainOutcome {
        if !self.connectivity.is_reachable().await {
            info!("No internet connection, drain skipped");
            return DrainOutcome::Offline;
        }

        match self.gate.send_enabled().await {
            Ok(Some(false)) => {
                info!("Sending data is off, drain skipped");
                return DrainOutcome::SendingDisabled;
            }
            Ok(_) => {}
            Err(e) => return storage_failed(e),
        }

        let force = match self.gate.force_send().await {
            Ok(force) => force,
            Err(e) => return storage_failed(e),
        };

        let items = {
            let _guard = self.list_lock.lock().await;
            match self.load_items().await {
                Ok(items) => items,
                Err(e) => return storage_failed(e),
            }
        };
        if items.is_empty() {
            return DrainOutcome::Empty;
        }

        let now = self.clock.now();
        let mut tally = DrainTally::default();
        let mut delivered = Vec::new();
        let mut halt = None;

        for item in &items {
            if !force && item.is_embargoed(now) {
                debug!(name = %item.name, send_after = ?item.send_after, "Item embargoed, leaving queued");
                tally.deferred += 1;
                continue;
            }

            let response = self
                .transport
                .send(&item.data, &item.name, &item.destination_id)
                .await;

            match response.classify() {
                Delivery::Accepted => {
                    debug!(name = %item.name, status = response.status, "Item delivered");
                    tally.sent += 1;
                    delivered.push(item.clone());
                }
                Delivery::Duplicate => {
                    info!(name = %item.name, status = response.status, "Item already on server");
                    tally.duplicates += 1;
                    delivered.push(item.clone());
                }
                Delivery::Unreachable => {
                    warn!(name = %item.name, "Network unavailable, pausing sync");
                    halt = Some(Halt::Paused);
                    break;
                }
                Delivery::Rejected => {
                    let description = response.describe();
                    warn!(
                        name = %item.name,
                        status = response.status,
                        response = %description,
                        "Server rejected item"
                    );
                    halt = Some(Halt::Rejected {
                        name: item.name.clone(),
                        status: response.status,
                        response: description,
                    });
                    break;
                }
            }
        }

        let remaining = if delivered.is_empty() {
            items.len()
        } else {
            match self.remove_delivered(&delivered).await {
                Ok(remaining) => remaining,
                Err(e) => return storage_failed(e),
            }
        };

        match halt {
            None => DrainOutcome::Completed { tally },
            Some(Halt::Paused) => DrainOutcome::Paused { tally, remaining },
            Some(Halt::Rejected {
                name,
                status,
                response,
            }) => DrainOutcome::Rejected {
                name,
                status,
                response,
                tally,
            },
        }
    }

    /// Re-read the record and drop the delivered items. Items re-queued or
    /// added while the pass was sending are kept.
    async fn remove_delivered(&self, delivered: &[QueueItem]) -> Result<usize, StorageError> {
        let _guard = self.list_lock.lock().await;
        let mut items = self.load_items().await?;
        items.retain(|item| !delivered.contains(item));
        self.save_items(&items).await?;
        Ok(items.len())
    }

    fn finish(&self, outcome: &DrainOutcome) {
        {
            let mut history = lock(&self.history);
            if outcome.is_success() {
                history.last_sync_at = Some(self.clock.now());
            }
            history.last_outcome = Some(outcome.clone());
        }
        *lock(&self.in_flight) = None;

        match outcome {
            DrainOutcome::Completed { tally } => info!(
                sent = tally.sent,
                duplicates = tally.duplicates,
                deferred = tally.deferred,
                "{outcome}"
            ),
            _ => debug!("Drain finished: {outcome}"),
        }
    }
}

fn storage_failed(e: StorageError) -> DrainOutcome {
    error!(error = %e, "Sync queue storage failure");
    DrainOutcome::StorageFailed {
        message: e.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
