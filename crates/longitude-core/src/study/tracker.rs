//! Experiment state machine.
//!
//! `ExperimentTracker` owns persistence of [`ParticipantState`]. Every
//! mutating operation is a full load, mutate, save round trip on the
//! `experimentState` record; there is no in-memory cache and no locking.
//! Two unawaited mutations of the same field are last-writer-wins.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::assignment::{definition_order, ConditionAssigner, DefinitionOrderAssigner};
use super::day::experiment_day;
use super::definition::{StudyDefinition, TaskId};
use super::display::{self, DisplayState};
use super::state::{ConditionAssignment, ParticipantState};
use crate::clock::Clock;
use crate::error::{CoreError, Result, StorageError};
use crate::storage::{load_json, save_json, KeyValueStore, STATE_KEY};
use crate::sync::SyncGate;

const PARTICIPANT_ID_LEN: usize = 16;

/// Inputs to [`ExperimentTracker::start_with`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Generated when `None`.
    pub participant_id: Option<String>,
    /// Skips the assignment service. Ignored when the study has no conditions.
    pub override_condition: Option<ConditionAssignment>,
    /// Initial participant variables, e.g. device info under `device`.
    pub participant_variables: serde_json::Map<String, Value>,
}

/// State machine for one participant in one study.
#[derive(Clone)]
pub struct ExperimentTracker {
    store: Arc<dyn KeyValueStore>,
    definition: Arc<StudyDefinition>,
    clock: Arc<dyn Clock>,
    assigner: Arc<dyn ConditionAssigner>,
}

impl ExperimentTracker {
    /// Tracker assigning conditions in definition order.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        definition: Arc<StudyDefinition>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            definition,
            clock,
            assigner: Arc::new(DefinitionOrderAssigner),
        }
    }

    /// Use an external assignment service.
    pub fn with_assigner(mut self, assigner: Arc<dyn ConditionAssigner>) -> Self {
        self.assigner = assigner;
        self
    }

    pub fn definition(&self) -> &StudyDefinition {
        &self.definition
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn shared_clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub(crate) fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    /// Persisted state, `None` before `start()`.
    pub async fn load_state(&self) -> Result<Option<ParticipantState>, StorageError> {
        load_json(self.store.as_ref(), STATE_KEY).await
    }

    async fn save_state(&self, state: &ParticipantState) -> Result<(), StorageError> {
        save_json(self.store.as_ref(), STATE_KEY, state).await
    }

    /// Begin the study now.
    pub async fn start(
        &self,
        participant_id: Option<String>,
        override_condition: Option<ConditionAssignment>,
    ) -> Result<ParticipantState> {
        self.start_with(StartOptions {
            participant_id,
            override_condition,
            ..StartOptions::default()
        })
        .await
    }

    /// Begin the study now, overwriting any previous state.
    pub async fn start_with(&self, options: StartOptions) -> Result<ParticipantState> {
        let participant_id = options
            .participant_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_participant_id);
        let condition = self.resolve_assignment(options.override_condition).await;

        let tasks_last_completion_date = self
            .definition
            .tasks
            .iter()
            .map(|task| (task.id.clone(), None))
            .collect();
        let notification_times = self
            .definition
            .tasks
            .iter()
            .filter_map(|task| {
                let template = task.notification.as_ref()?;
                Some((task.id.clone(), template.default_time.clone()))
            })
            .collect();

        let state = ParticipantState {
            start_date: Some(self.clock.now()),
            participant_id: Some(participant_id),
            send_data: Some(self.definition.send_data.unwrap_or(true)),
            tasks_last_completion_date,
            notification_times,
            participant_variables: options.participant_variables,
            experiment_ended: false,
            force_send_data: false,
            condition,
        };

        self.save_state(&state).await?;
        info!(
            participant_id = state.participant_id.as_deref().unwrap_or_default(),
            study = %self.definition.name,
            "Study started"
        );
        Ok(state)
    }

    async fn resolve_assignment(
        &self,
        override_condition: Option<ConditionAssignment>,
    ) -> Option<ConditionAssignment> {
        let Some(block) = &self.definition.conditions else {
            if override_condition.is_some() {
                debug!("Ignoring condition override: study defines no conditions");
            }
            return None;
        };

        if let Some(assignment) = override_condition {
            return Some(assignment);
        }

        match self.assigner.assign(block).await {
            Ok(assignment) => Some(assignment),
            Err(e) => {
                warn!(error = %e, "Falling back to definition-order condition assignment");
                definition_order(block).ok()
            }
        }
    }

    /// Load, apply `mutate`, save. `None` when no study is active.
    async fn update<F>(&self, mutate: F) -> Result<Option<ParticipantState>>
    where
        F: FnOnce(&mut ParticipantState) + Send,
    {
        let Some(mut state) = self.load_state().await? else {
            return Ok(None);
        };
        mutate(&mut state);
        self.save_state(&state).await?;
        Ok(Some(state))
    }

    /// Stamp `task_id` as completed now.
    pub async fn record_task_completion(&self, task_id: &str) -> Result<ParticipantState> {
        if self.definition.task(task_id).is_none() {
            warn!(task_id, "Recording completion for a task not in the study definition");
        }

        let now = self.clock.now();
        let state = self
            .update(|state| {
                state
                    .tasks_last_completion_date
                    .insert(task_id.to_string(), Some(now));
            })
            .await?
            .ok_or(CoreError::NoActiveStudy)?;

        debug!(task_id, "Task completion recorded");
        Ok(state)
    }

    /// Display state for right now.
    pub fn compute_display_state(&self, state: &ParticipantState) -> DisplayState<'_> {
        display::compute_display_state(&self.definition, state, self.clock.as_ref())
    }

    /// Forget every completion, keeping the task keys.
    pub async fn reset_task_completions(&self) -> Result<Option<ParticipantState>> {
        self.update(|state| {
            for completed_at in state.tasks_last_completion_date.values_mut() {
                *completed_at = None;
            }
        })
        .await
    }

    pub async fn update_notification_times(
        &self,
        times: BTreeMap<TaskId, Option<String>>,
    ) -> Result<Option<ParticipantState>> {
        self.update(|state| state.notification_times = times).await
    }

    /// Record consent to send data.
    pub async fn update_consent(&self, send_data: bool) -> Result<Option<ParticipantState>> {
        self.update(|state| state.send_data = Some(send_data)).await
    }

    pub async fn update_force_send(&self, force: bool) -> Result<Option<ParticipantState>> {
        self.update(|state| state.force_send_data = force).await
    }

    pub async fn set_participant_variable(
        &self,
        key: &str,
        value: Value,
    ) -> Result<Option<ParticipantState>> {
        self.update(|state| {
            state.participant_variables.insert(key.to_string(), value);
        })
        .await
    }

    /// Mark the study over and release any embargoed data.
    pub async fn end_experiment(&self) -> Result<Option<ParticipantState>> {
        let state = self
            .update(|state| {
                state.experiment_ended = true;
                state.force_send_data = true;
            })
            .await?;
        if state.is_some() {
            info!("Experiment ended");
        }
        Ok(state)
    }

    /// Abandon the study. Clears the whole store, queued data included.
    pub async fn stop(&self) -> Result<()> {
        self.store.clear().await?;
        info!("Study stopped, all persisted data cleared");
        Ok(())
    }

    /// Current study day, `-1` without an active study.
    pub async fn days_since_start(&self) -> Result<i64> {
        let start = self.load_state().await?.and_then(|s| s.start_date);
        Ok(experiment_day(start, self.clock.as_ref(), self.definition.cutoff_hour))
    }

    /// Consent to send. `None` without an active study.
    pub async fn send_data_enabled(&self) -> Result<Option<bool>, StorageError> {
        Ok(self
            .load_state()
            .await?
            .map(|state| state.send_data.unwrap_or(true)))
    }

    pub async fn force_send_enabled(&self) -> Result<bool, StorageError> {
        Ok(self
            .load_state()
            .await?
            .is_some_and(|state| state.force_send_data))
    }
}

#[async_trait]
impl SyncGate for ExperimentTracker {
    async fn send_enabled(&self) -> Result<Option<bool>, StorageError> {
        self.send_data_enabled().await
    }

    async fn force_send(&self) -> Result<bool, StorageError> {
        self.force_send_enabled().await
    }
}

/// Queue item name for a task submission: `{pid}_{task}` or `{pid}_{task}_{day}`.
pub fn task_filename(participant_id: &str, task_id: &str, day: Option<i64>) -> String {
    match day {
        Some(day) => format!("{participant_id}_{task_id}_{day}"),
        None => format!("{participant_id}_{task_id}"),
    }
}

fn generate_participant_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PARTICIPANT_ID_LEN)
        .map(char::from)
        .collect()
}
