//! Durable store-and-forward delivery of collected data.
//!
//! Completed tasks hand their payloads to [`SyncQueue`], which persists them
//! and delivers them through an injected [`Transport`] whenever the network
//! and the participant's consent allow.

pub mod gate;
pub mod sync_queue;
pub mod transport;
pub mod types;


pub use gate::{StaticGate, SyncGate};
pub use sync_queue::{SyncQueue, SyncQueueBuilder};
pub use transport::{
    AlwaysOnline, Connectivity, ConnectivityFlag, Delivery, Transport, TransportResponse,
};
pub use types::{DrainOutcome, DrainTally, QueueItem, SyncStatus};
