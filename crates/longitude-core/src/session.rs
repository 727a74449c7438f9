//! Study session.
//!
//! Ties the state machine to the sync queue so the application shell
//! submits a task in one call. The payload is saved locally under its
//! task filename and queued when the task has a destination. The
//! completion is recorded after that and the next route is derived.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::storage::{load_json, save_json};
use crate::study::condition::resolve_condition;
use crate::study::day::{experiment_day, next_cutoff_after};
use crate::study::display::{DisplayState, UNKNOWN_PARTICIPANT_ID};
use crate::study::{task_filename, ExperimentTracker, ParticipantState, StartOptions};
use crate::sync::{DrainOutcome, QueueItem, SyncQueue, SyncQueueBuilder};

/// Where the shell should go after a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The study is over.
    End,
    /// Open the next available task.
    Task(String),
    Home,
}

/// Result of [`StudySession::submit_task_data`].
#[derive(Debug)]
pub struct Submission<'a> {
    pub state: ParticipantState,
    pub display: DisplayState<'a>,
    pub route: Route,
    /// Name of the queued item, `None` when the task keeps its data local.
    pub queued_as: Option<String>,
}

/// One participant's study, tracker and outbox together.
#[derive(Clone)]
pub struct StudySession {
    tracker: ExperimentTracker,
    queue: SyncQueue,
}

impl StudySession {
    /// Finish `queue` with the tracker as its send gate and clock.
    pub fn new(tracker: ExperimentTracker, queue: SyncQueueBuilder) -> Self {
        let queue = queue
            .gate(Arc::new(tracker.clone()))
            .clock(tracker.shared_clock())
            .build();
        Self { tracker, queue }
    }

    pub fn tracker(&self) -> &ExperimentTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Start the study and queue the participant info record.
    pub async fn start(&self, options: StartOptions) -> Result<ParticipantState> {
        let state = self.tracker.start_with(options).await?;

        if let Some(destination) = &self.tracker.definition().participant_info_datapipe_id {
            let participant_id = state.participant_id.as_deref().unwrap_or(UNKNOWN_PARTICIPANT_ID);
            let info = json!({
                "participantId": participant_id,
                "startDate": state.start_date,
                "condition": state.condition.as_ref().map(|c| c.summary()),
                "device": state.participant_variables.get("device"),
            });
            self.queue
                .enqueue(QueueItem::new(
                    format!("{participant_id}_participantInfo"),
                    info.to_string(),
                    destination.clone(),
                ))
                .await?;
        }

        Ok(state)
    }

    /// Save and queue `responses` for `task_id`, mark it complete and pick the next
    /// route.
    ///
    /// Editable tasks are held back until the next cutoff so late edits
    /// replace the queued payload instead of producing a second upload.
    pub async fn submit_task_data(&self, task_id: &str, responses: Value) -> Result<Submission<'_>> {
        let definition = self.tracker.definition();
        let clock = self.tracker.clock();

        let state = self
            .tracker
            .load_state()
            .await?
            .ok_or(CoreError::NoActiveStudy)?;
        let task = definition
            .task(task_id)
            .ok_or_else(|| CoreError::UnknownTask(task_id.to_string()))?;

        let day = experiment_day(state.start_date, clock, definition.cutoff_hour);
        let participant_id = state
            .participant_id
            .clone()
            .unwrap_or_else(|| UNKNOWN_PARTICIPANT_ID.to_string());

        let mut payload = Map::new();
        payload.insert("participantId".into(), Value::String(participant_id.clone()));
        payload.insert("taskId".into(), Value::String(task_id.to_string()));
        payload.insert("responses".into(), responses);
        if definition.is_longitudinal() {
            payload.insert("day".into(), json!(day));
        }
        if definition.conditions.is_some() {
            let resolution = resolve_condition(definition, &state, day);
            payload.insert("condition".into(), json!(resolution.condition));
        }

        let repeats = task.show_on_days.len() > 1;
        let name = task_filename(&participant_id, task_id, repeats.then_some(day));
        let payload = Value::Object(payload);
        save_json(self.tracker.store(), &name, &payload).await?;

        let queued_as = match &task.datapipe_id {
            Some(destination) => {
                let mut item = QueueItem::new(name.clone(), payload.to_string(), destination.clone());
                if task.allow_edit {
                    let cutoff = next_cutoff_after(clock.to_local(clock.now()), definition.cutoff_hour);
                    if let Some(at) = clock.to_instant(cutoff) {
                        item = item.send_after(at);
                    }
                }
                self.queue.enqueue(item).await?;
                Some(name)
            }
            None => {
                debug!(task_id, name = %name, "Task has no destination, data kept local");
                None
            }
        };

        let state = self.tracker.record_task_completion(task_id).await?;
        let display = self.tracker.compute_display_state(&state);
        let route = route_after(&display, definition.autoroute);
        info!(task_id, day, route = ?route, "Task submitted");

        Ok(Submission {
            state,
            display,
            route,
            queued_as,
        })
    }

    /// Last submission saved for `task_id`, as built by
    /// [`submit_task_data`](Self::submit_task_data).
    ///
    /// `day` picks the experiment day for tasks shown on several days and
    /// defaults to today. It is ignored for single-day tasks.
    pub async fn load_task_data(&self, task_id: &str, day: Option<i64>) -> Result<Option<Value>> {
        let definition = self.tracker.definition();
        let task = definition
            .task(task_id)
            .ok_or_else(|| CoreError::UnknownTask(task_id.to_string()))?;
        let Some(state) = self.tracker.load_state().await? else {
            return Ok(None);
        };

        let participant_id = state
            .participant_id
            .as_deref()
            .unwrap_or(UNKNOWN_PARTICIPANT_ID);
        let day = (task.show_on_days.len() > 1).then(|| {
            day.unwrap_or_else(|| {
                experiment_day(state.start_date, self.tracker.clock(), definition.cutoff_hour)
            })
        });
        let name = task_filename(participant_id, task_id, day);
        Ok(load_json(self.tracker.store(), &name).await?)
    }

    /// End the study and flush everything queued, embargoes included.
    pub async fn end_experiment(&self) -> Result<Option<DrainOutcome>> {
        if self.tracker.end_experiment().await?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.queue.drain().await))
    }

    /// Abandon the study, discarding participant state and queued data.
    pub async fn stop(&self) -> Result<()> {
        self.tracker.stop().await
    }
}

/// Next route given the post-submission display state.
pub fn route_after(display: &DisplayState<'_>, autoroute: bool) -> Route {
    if display.is_experiment_complete {
        return Route::End;
    }
    if autoroute {
        if let Some(next) = display.next_available_task() {
            return Route::Task(next.definition.kind.href(&next.definition.id));
        }
    }
    Route::Home
}
