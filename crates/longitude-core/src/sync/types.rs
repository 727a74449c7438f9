//! Core types for the durable sync queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One payload waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Idempotency key; at most one queued item per name.
    pub name: String,
    /// Serialized payload, sent verbatim.
    pub data: String,
    /// Remote bucket the payload belongs to.
    #[serde(rename = "datapipeId")]
    pub destination_id: String,
    /// Earliest instant the item may be sent, unless forced.
    #[serde(rename = "sendAfter", default, skip_serializing_if = "Option::is_none")]
    pub send_after: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(
        name: impl Into<String>,
        data: impl Into<String>,
        destination_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            destination_id: destination_id.into(),
            send_after: None,
        }
    }

    /// Hold the item until `at`.
    pub fn send_after(mut self, at: DateTime<Utc>) -> Self {
        self.send_after = Some(at);
        self
    }

    pub fn is_embargoed(&self, now: DateTime<Utc>) -> bool {
        self.send_after.is_some_and(|at| now < at)
    }
}

/// What happened to the items a drain pass looked at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainTally {
    /// Accepted by the server.
    pub sent: usize,
    /// Already on the server; removed as if sent.
    pub duplicates: usize,
    /// Left queued because of an embargo.
    pub deferred: usize,
}

impl DrainTally {
    pub fn delivered(&self) -> usize {
        self.sent + self.duplicates
    }
}

/// Result of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Connectivity probe failed; nothing attempted.
    Offline,
    /// Participant has not consented to sending.
    SendingDisabled,
    /// Queue was empty.
    Empty,
    /// Every eligible item was delivered.
    Completed { tally: DrainTally },
    /// Transport reported the network unreachable mid-pass.
    Paused { tally: DrainTally, remaining: usize },
    /// Server refused an item.
    Rejected {
        name: String,
        status: u16,
        response: String,
        tally: DrainTally,
    },
    /// The queue record could not be read or written.
    StorageFailed { message: String },
}

impl DrainOutcome {
    /// Delivery counts, when the pass got as far as sending.
    pub fn tally(&self) -> Option<DrainTally> {
        match self {
            DrainOutcome::Completed { tally }
            | DrainOutcome::Paused { tally, .. }
            | DrainOutcome::Rejected { tally, .. } => Some(*tally),
            DrainOutcome::Offline
            | DrainOutcome::SendingDisabled
            | DrainOutcome::Empty
            | DrainOutcome::StorageFailed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DrainOutcome::Completed { .. } | DrainOutcome::Empty)
    }
}

impl fmt::Display for DrainOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainOutcome::Offline => f.write_str("No internet connection"),
            DrainOutcome::SendingDisabled => f.write_str("Sending data is off"),
            DrainOutcome::Empty => f.write_str("No items to sync"),
            DrainOutcome::Completed { tally } if tally.deferred > 0 => write!(
                f,
                "All items successfully sent to server ({} waiting for their send time)",
                tally.deferred
            ),
            DrainOutcome::Completed { .. } => f.write_str("All items successfully sent to server"),
            DrainOutcome::Paused { .. } => f.write_str("Network unavailable. Pausing sync."),
            DrainOutcome::Rejected { name, response, .. } => write!(
                f,
                "Send to server failed for {name}\n\nServer Response:\n{response}"
            ),
            DrainOutcome::StorageFailed { message } => {
                write!(f, "Could not access the data queue: {message}")
            }
        }
    }
}

/// Current sync status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    /// Last time a drain delivered everything it could.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Number of queued items.
    pub pending_count: usize,
    /// Whether a drain is currently in progress.
    pub in_progress: bool,
    /// Outcome of the most recent finished drain.
    pub last_outcome: Option<DrainOutcome>,
}
