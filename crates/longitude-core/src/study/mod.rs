//! Experiment state machine.
//!
//! A static [`StudyDefinition`] plus one persisted [`ParticipantState`]
//! determine everything the participant sees on a given day. The derived
//! [`DisplayState`] is never stored.

pub mod assignment;
pub mod condition;
pub mod day;
pub mod definition;
pub mod display;
pub mod state;
pub mod tracker;

pub use assignment::{AssignmentError, ConditionAssigner, DefinitionOrderAssigner, FixedAssigner};
pub use condition::{resolve_condition, ConditionResolution, ERROR_CONDITION};
pub use day::{experiment_day, next_cutoff_after, NO_ACTIVE_STUDY_DAY};
pub use definition::{
    Comparison, ConditionBlock, NotificationTemplate, SkipRule, StudyDefinition, TaskDescriptor,
    TaskId, TaskKind,
};
pub use display::{compute_display_state, DisplayState, TaskDisplayStatus};
pub use state::{ConditionAssignment, ParticipantState, StateKey};
pub use tracker::{task_filename, ExperimentTracker, StartOptions};
