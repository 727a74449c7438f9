//! Display state derivation.
//!
//! Pure function of participant state, study definition and the clock.
//! Nothing here is persisted and nothing here fails: the shell always gets
//! a renderable view, even for inconsistent inputs.
//!
//! ## Gating
//!
//! Visible tasks are strict sequential gates. A task is reachable only
//! when every visible task before it is completed or skipped today.

use serde::Serialize;
use tracing::warn;

use super::condition::resolve_condition;
use super::day::{experiment_day, happened_today};
use super::definition::{StudyDefinition, TaskDescriptor};
use super::state::ParticipantState;
use crate::clock::Clock;

/// Reported as the participant id when none is stored.
pub const UNKNOWN_PARTICIPANT_ID: &str = "NO_ID";

/// Derived per-task view for today.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDisplayStatus<'a> {
    pub definition: &'a TaskDescriptor,
    pub is_allowed: bool,
    pub completed: bool,
    /// Completed only because its skip rule matched.
    pub skipped: bool,
}

/// Derived view of the whole study for today.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayState<'a> {
    pub participant_id: String,
    pub experiment_day: i64,
    pub current_condition: Option<String>,
    pub current_condition_index: Option<usize>,
    pub is_experiment_complete: bool,
    pub all_tasks_complete_today: bool,
    pub tasks: Vec<TaskDisplayStatus<'a>>,
}

impl<'a> DisplayState<'a> {
    /// First task that is open and not yet done.
    pub fn next_available_task(&self) -> Option<&TaskDisplayStatus<'a>> {
        self.tasks.iter().find(|t| t.is_allowed && !t.completed)
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskDisplayStatus<'a>> {
        self.tasks.iter().find(|t| t.definition.id == task_id)
    }
}

/// Tasks shown on `experiment_day` for `condition`, in definition order.
pub fn visible_tasks<'a>(
    definition: &'a StudyDefinition,
    experiment_day: i64,
    condition: Option<&str>,
) -> Vec<&'a TaskDescriptor> {
    definition
        .tasks
        .iter()
        .filter(|task| {
            let on_day = task.show_on_days.is_empty() || task.show_on_days.contains(&experiment_day);
            let for_condition = match condition {
                None => true,
                Some(c) => {
                    task.show_for_conditions.is_empty()
                        || task.show_for_conditions.iter().any(|tc| tc == c)
                }
            };
            on_day && for_condition
        })
        .collect()
}

/// Walk visible tasks in order and decide completion and reachability.
pub fn task_statuses<'a>(
    visible: &[&'a TaskDescriptor],
    state: &ParticipantState,
    clock: &dyn Clock,
    cutoff_hour: u32,
) -> Vec<TaskDisplayStatus<'a>> {
    let mut all_prior_complete = true;
    let mut statuses = Vec::with_capacity(visible.len());

    for &task in visible {
        let done_today = state
            .last_completion(&task.id)
            .is_some_and(|at| happened_today(at, clock, cutoff_hour));

        // Only consult the skip rule while the task is still open.
        let skipped = !done_today
            && task.skip_if.as_ref().is_some_and(|rule| match rule.evaluate(state) {
                Some(matched) => matched,
                None => {
                    warn!(
                        task_id = %task.id,
                        state_key = %rule.state_key,
                        "skip_if state key not found in participant state"
                    );
                    false
                }
            });

        let completed = done_today || skipped;
        let is_allowed =
            (all_prior_complete && !completed) || (completed && task.allow_edit && !skipped);

        statuses.push(TaskDisplayStatus {
            definition: task,
            is_allowed,
            completed,
            skipped,
        });

        if !completed {
            all_prior_complete = false;
        }
    }

    statuses
}

/// Whether the study is over.
///
/// Without a day limit, the study ends once everything visible today is
/// complete and at least one visible task is editable; a day with no real
/// tasks never ends the study.
pub fn is_experiment_complete(
    definition: &StudyDefinition,
    state: &ParticipantState,
    experiment_day: i64,
    all_tasks_complete_today: bool,
    any_task_editable: bool,
) -> bool {
    if state.experiment_ended {
        return true;
    }
    match definition.total_days {
        None => all_tasks_complete_today && any_task_editable,
        Some(total) => {
            experiment_day > total || (experiment_day == total && all_tasks_complete_today)
        }
    }
}

/// Derive the display state for right now.
pub fn compute_display_state<'a>(
    definition: &'a StudyDefinition,
    state: &ParticipantState,
    clock: &dyn Clock,
) -> DisplayState<'a> {
    let cutoff = definition.cutoff_hour;
    let day = experiment_day(state.start_date, clock, cutoff);
    let resolution = resolve_condition(definition, state, day);

    let visible = visible_tasks(definition, day, resolution.condition.as_deref());
    let tasks = task_statuses(&visible, state, clock, cutoff);

    let all_tasks_complete_today = tasks.iter().all(|t| t.completed);
    let any_task_editable = visible.iter().any(|t| t.allow_edit);

    DisplayState {
        participant_id: state
            .participant_id
            .clone()
            .unwrap_or_else(|| UNKNOWN_PARTICIPANT_ID.to_string()),
        experiment_day: day,
        current_condition: resolution.condition,
        current_condition_index: resolution.index,
        is_experiment_complete: is_experiment_complete(
            definition,
            state,
            day,
            all_tasks_complete_today,
            any_task_editable,
        ),
        all_tasks_complete_today,
        tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::study::definition::{Comparison, SkipRule, TaskKind};
    use crate::study::state::StateKey;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn task(id: &str) -> TaskDescriptor {
        TaskDescriptor {
            id: id.into(),
            name: id.into(),
            prompt: None,
            show_on_days: vec![],
            show_for_conditions: vec![],
            allow_edit: false,
            skip_if: None,
            notification: None,
            datapipe_id: None,
            params: serde_json::Map::new(),
            kind: TaskKind::Survey { questions: vec![] },
        }
    }

    fn definition(tasks: Vec<TaskDescriptor>) -> StudyDefinition {
        StudyDefinition {
            name: "gating".into(),
            total_days: None,
            cutoff_hour: 4,
            participant_info_datapipe_id: None,
            autoroute: false,
            conditions: None,
            tasks,
            send_data: None,
            end_text: None,
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn state_for(def: &StudyDefinition) -> ParticipantState {
        ParticipantState {
            start_date: Some(start()),
            participant_id: Some("p-1".into()),
            send_data: None,
            tasks_last_completion_date: def.tasks.iter().map(|t| (t.id.clone(), None)).collect(),
            notification_times: BTreeMap::new(),
            participant_variables: serde_json::Map::new(),
            experiment_ended: false,
            force_send_data: false,
            condition: None,
        }
    }

    fn allowed(display: &DisplayState<'_>) -> Vec<bool> {
        display.tasks.iter().map(|t| t.is_allowed).collect()
    }

    #[test]
    fn test_only_first_task_allowed_initially() {
        let def = definition(vec![task("t1"), task("t2"), task("t3")]);
        let clock = FixedClock::new(start() + Duration::hours(1));
        let display = compute_display_state(&def, &state_for(&def), &clock);

        assert_eq!(display.experiment_day, 0);
        assert_eq!(allowed(&display), vec![true, false, false]);
        assert!(!display.all_tasks_complete_today);
        assert_eq!(display.next_available_task().unwrap().definition.id, "t1");
    }

    #[test]
    fn test_completing_first_unlocks_second() {
        let def = definition(vec![task("t1"), task("t2"), task("t3")]);
        let clock = FixedClock::new(start() + Duration::hours(1));
        let mut state = state_for(&def);
        state
            .tasks_last_completion_date
            .insert("t1".into(), Some(clock.now()));

        let display = compute_display_state(&def, &state, &clock);
        assert!(display.tasks[0].completed);
        assert_eq!(allowed(&display), vec![false, true, false]);
    }

    #[test]
    fn test_editable_completed_task_stays_allowed() {
        let mut t1 = task("t1");
        t1.allow_edit = true;
        let def = definition(vec![t1, task("t2")]);
        let clock = FixedClock::new(start() + Duration::hours(1));
        let mut state = state_for(&def);
        state
            .tasks_last_completion_date
            .insert("t1".into(), Some(clock.now()));

        let display = compute_display_state(&def, &state, &clock);
        assert_eq!(allowed(&display), vec![true, true]);
    }

    #[test]
    fn test_yesterdays_completion_does_not_count() {
        let def = definition(vec![task("t1"), task("t2")]);
        let clock = FixedClock::new(start() + Duration::days(1));
        let mut state = state_for(&def);
        state.tasks_last_completion_date.insert("t1".into(), Some(start()));

        let display = compute_display_state(&def, &state, &clock);
        assert_eq!(display.experiment_day, 1);
        assert!(!display.tasks[0].completed);
        assert_eq!(allowed(&display), vec![true, false]);
    }

    #[test]
    fn test_skip_rule_completes_without_timestamp() {
        let mut t2 = task("t2");
        t2.allow_edit = true;
        t2.skip_if = Some(SkipRule {
            state_key: StateKey::ParticipantVariable(vec!["device".into(), "deviceType".into()]),
            operator: Comparison::NotEqual,
            compare_value: json!("PHONE"),
        });
        let def = definition(vec![task("t1"), t2, task("t3")]);
        let clock = FixedClock::new(start() + Duration::hours(1));
        let mut state = state_for(&def);
        state
            .participant_variables
            .insert("device".into(), json!({"deviceType": "TABLET"}));
        state
            .tasks_last_completion_date
            .insert("t1".into(), Some(clock.now()));

        let display = compute_display_state(&def, &state, &clock);
        let t2 = display.task("t2").unwrap();
        assert!(t2.completed);
        assert!(t2.skipped);
        // Skipped tasks are never editable.
        assert!(!t2.is_allowed);
        assert!(display.task("t3").unwrap().is_allowed);
        assert_eq!(state.last_completion("t2"), None);
    }

    #[test]
    fn test_unresolved_skip_key_does_not_skip() {
        let mut t1 = task("t1");
        t1.skip_if = Some(SkipRule {
            state_key: StateKey::ParticipantVariable(vec!["missing".into()]),
            operator: Comparison::NotEqual,
            compare_value: json!("x"),
        });
        let def = definition(vec![t1]);
        let clock = FixedClock::new(start());
        let display = compute_display_state(&def, &state_for(&def), &clock);
        assert!(!display.tasks[0].completed);
    }

    #[test]
    fn test_visibility_by_day_and_condition() {
        let mut day1 = task("day1");
        day1.show_on_days = vec![1];
        let mut only_b = task("onlyB");
        only_b.show_for_conditions = vec!["B".into()];
        let def = definition(vec![task("always"), day1, only_b]);

        let ids = |v: Vec<&TaskDescriptor>| v.iter().map(|t| t.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(visible_tasks(&def, 0, Some("A"))), vec!["always"]);
        assert_eq!(ids(visible_tasks(&def, 1, Some("B"))), vec!["always", "day1", "onlyB"]);
        assert_eq!(ids(visible_tasks(&def, 0, None)), vec!["always", "onlyB"]);
    }

    #[test]
    fn test_completion_without_day_limit_requires_editable_task() {
        let def = definition(vec![]);
        let clock = FixedClock::new(start());
        let display = compute_display_state(&def, &state_for(&def), &clock);
        // Vacuously complete, but nothing editable: not the end.
        assert!(display.all_tasks_complete_today);
        assert!(!display.is_experiment_complete);

        let mut t1 = task("t1");
        t1.allow_edit = true;
        let def = definition(vec![t1]);
        let mut state = state_for(&def);
        state.tasks_last_completion_date.insert("t1".into(), Some(start()));
        let display = compute_display_state(&def, &state, &clock);
        assert!(display.is_experiment_complete);
    }

    #[test]
    fn test_completion_with_day_limit() {
        let mut def = definition(vec![task("t1")]);
        def.total_days = Some(2);
        let state = state_for(&def);

        let clock = FixedClock::new(start() + Duration::days(1));
        assert!(!compute_display_state(&def, &state, &clock).is_experiment_complete);

        clock.set(start() + Duration::days(2));
        assert!(!compute_display_state(&def, &state, &clock).is_experiment_complete);

        let mut done = state.clone();
        done.tasks_last_completion_date.insert("t1".into(), Some(clock.now()));
        assert!(compute_display_state(&def, &done, &clock).is_experiment_complete);

        clock.set(start() + Duration::days(3));
        assert!(compute_display_state(&def, &state, &clock).is_experiment_complete);
    }

    #[test]
    fn test_ended_flag_marks_complete() {
        let def = definition(vec![task("t1")]);
        let mut state = state_for(&def);
        state.experiment_ended = true;
        let clock = FixedClock::new(start());
        assert!(compute_display_state(&def, &state, &clock).is_experiment_complete);
    }

    #[test]
    fn test_no_start_date_yields_sentinel_day() {
        let def = definition(vec![task("t1")]);
        let mut state = state_for(&def);
        state.start_date = None;
        let clock = FixedClock::new(start());
        let display = compute_display_state(&def, &state, &clock);
        assert_eq!(display.experiment_day, -1);
        assert!(!display.is_experiment_complete);
    }
}
