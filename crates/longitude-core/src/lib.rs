//! # Longitude Core Library
//!
//! Core runtime for longitudinal research studies. It tracks one
//! participant's progress through a multi-day, multi-task, multi-condition
//! study and delivers the collected data to a remote collection endpoint
//! despite intermittent connectivity. Rendering, the HTTP client and
//! condition randomization belong to the application shell.
//!
//! ## Architecture
//!
//! - **Study**: a state machine over one persisted participant record and an
//!   immutable study definition. Day number, condition and task gating are
//!   derived on demand, never stored.
//! - **Sync**: a durable outbox persisted in the key-value store and drained
//!   oldest first through an injected transport.
//! - **Storage**: a minimal key to JSON document store, plus TOML-based
//!   configuration.
//!
//! ## Key Components
//!
//! - [`ExperimentTracker`]: Participant state machine
//! - [`SyncQueue`]: Durable, reentrant-safe delivery queue
//! - [`StudySession`]: Submission flow across both
//! - [`Config`]: Runtime configuration management

pub mod clock;
pub mod error;
pub mod session;
pub mod storage;
pub mod study;
pub mod sync;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{ConfigError, CoreError, DefinitionError, StorageError};
pub use session::{Route, StudySession, Submission};
pub use storage::{Config, FileStore, KeyValueStore, MemoryStore};
pub use study::{
    DisplayState, ExperimentTracker, ParticipantState, StartOptions, StudyDefinition, TaskKind,
};
pub use sync::{DrainOutcome, QueueItem, SyncQueue, Transport, TransportResponse};
