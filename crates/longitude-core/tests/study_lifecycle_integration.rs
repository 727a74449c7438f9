//! Integration tests for the study lifecycle.
//!
//! Drives a file-backed study from a definition on disk through several
//! days, condition changes, skip rules and a stop/start reset.

use chrono::{Duration, TimeZone, Utc};
use longitude_core::study::{ConditionAssignment, StudyDefinition};
use longitude_core::{
    Clock, ExperimentTracker, FileStore, FixedClock, KeyValueStore, StartOptions,
};
use serde_json::json;
use std::sync::Arc;

const STUDY_TOML: &str = r#"
name = "Sound and sleep"
total_days = 7
cutoff_hour = 4

[conditions]
conditions = ["silence", "noise", "music"]
repeatedMeasures = true
increase_on_days = [2, 6]

[[tasks]]
id = "consent"
type = "screen"
path_to_screen = "/consent"
show_on_days = [0]

[[tasks]]
id = "morningDiary"
type = "survey"
allow_edit = true
datapipe_id = "pipe-diary"

[tasks.notification]
prompt = "How did you sleep?"
default_time = "08:30"

[[tasks]]
id = "phoneSetup"
type = "web"
url = "https://example.org/setup"
show_on_days = [0]

[tasks.skip_if]
state_key = "participantVariables.device.deviceType"
operator = "!="
compare_value = "PHONE"

[[tasks]]
id = "musicRating"
type = "survey"
show_for_conditions = ["music"]
"#;

fn load_definition(dir: &std::path::Path) -> StudyDefinition {
    let path = dir.join("study.toml");
    std::fs::write(&path, STUDY_TOML).unwrap();
    StudyDefinition::load(&path).unwrap()
}

fn task_ids(display: &longitude_core::DisplayState<'_>) -> Vec<String> {
    display
        .tasks
        .iter()
        .map(|t| t.definition.id.clone())
        .collect()
}

#[tokio::test]
async fn test_multi_day_repeated_measures_study() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let definition = Arc::new(load_definition(temp_dir.path()));
    let store = Arc::new(FileStore::new(temp_dir.path().join("store")));
    let start = Utc.with_ymd_and_hms(2025, 3, 1, 21, 0, 0).unwrap();
    let clock = Arc::new(FixedClock::new(start));
    let tracker = ExperimentTracker::new(store.clone(), definition.clone(), clock.clone());

    let mut variables = serde_json::Map::new();
    variables.insert("device".into(), json!({"deviceType": "TABLET"}));
    let state = tracker
        .start_with(StartOptions {
            participant_id: Some("p-42".into()),
            participant_variables: variables,
            ..StartOptions::default()
        })
        .await
        .unwrap();

    // Day 0: consent gates the rest; the phone task is skipped on a tablet.
    let display = tracker.compute_display_state(&state);
    assert_eq!(display.experiment_day, 0);
    assert_eq!(display.current_condition.as_deref(), Some("silence"));
    assert_eq!(task_ids(&display), vec!["consent", "morningDiary", "phoneSetup"]);
    assert!(display.tasks[0].is_allowed);
    assert!(!display.tasks[1].is_allowed);
    assert!(display.task("phoneSetup").unwrap().completed);

    tracker.record_task_completion("consent").await.unwrap();
    let state = tracker.record_task_completion("morningDiary").await.unwrap();
    let display = tracker.compute_display_state(&state);
    assert!(display.all_tasks_complete_today);
    assert!(!display.is_experiment_complete);
    // The diary stays open for edits until the cutoff.
    assert!(display.task("morningDiary").unwrap().is_allowed);

    // 02:00 the next morning is still day 0 with a 4am cutoff.
    clock.set(start + Duration::hours(5));
    assert_eq!(tracker.days_since_start().await.unwrap(), 0);

    // Day 2: the condition advances and the diary reopens.
    clock.set(start + Duration::days(2));
    let state = tracker.load_state().await.unwrap().unwrap();
    let display = tracker.compute_display_state(&state);
    assert_eq!(display.experiment_day, 2);
    assert_eq!(display.current_condition.as_deref(), Some("noise"));
    assert_eq!(display.current_condition_index, Some(1));
    assert_eq!(task_ids(&display), vec!["morningDiary"]);
    assert!(!display.tasks[0].completed);

    // Day 6: music condition shows its extra task.
    clock.set(start + Duration::days(6));
    let display = tracker.compute_display_state(&state);
    assert_eq!(display.current_condition.as_deref(), Some("music"));
    assert_eq!(task_ids(&display), vec!["morningDiary", "musicRating"]);

    // Day 8 is past the seven-day limit.
    clock.set(start + Duration::days(8));
    let display = tracker.compute_display_state(&state);
    assert!(display.is_experiment_complete);
    assert_eq!(display.current_condition.as_deref(), Some("music"));
}

#[tokio::test]
async fn test_state_survives_tracker_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let definition = Arc::new(load_definition(temp_dir.path()));
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let store_dir = temp_dir.path().join("store");

    let first = ExperimentTracker::new(
        Arc::new(FileStore::new(&store_dir)),
        definition.clone(),
        clock.clone(),
    );
    let order = ConditionAssignment::Repeated {
        condition_order: vec!["music".into(), "noise".into(), "silence".into()],
    };
    first
        .start(Some("p-7".into()), Some(order.clone()))
        .await
        .unwrap();
    first.record_task_completion("consent").await.unwrap();
    first.update_consent(false).await.unwrap();

    let second = ExperimentTracker::new(Arc::new(FileStore::new(&store_dir)), definition, clock.clone());
    let state = second.load_state().await.unwrap().unwrap();
    assert_eq!(state.participant_id.as_deref(), Some("p-7"));
    assert_eq!(state.condition, Some(order));
    assert_eq!(state.last_completion("consent"), Some(clock.now()));
    assert_eq!(second.send_data_enabled().await.unwrap(), Some(false));
    assert_eq!(
        state.notification_times.get("morningDiary"),
        Some(&Some("08:30".to_string()))
    );
}

#[tokio::test]
async fn test_stop_then_start_round_trip() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let definition = Arc::new(load_definition(temp_dir.path()));
    let store = Arc::new(FileStore::new(temp_dir.path().join("store")));
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap(),
    ));
    let tracker = ExperimentTracker::new(store.clone(), definition, clock.clone());

    tracker.start(Some("old".into()), None).await.unwrap();
    tracker.record_task_completion("consent").await.unwrap();
    tracker.end_experiment().await.unwrap();

    tracker.stop().await.unwrap();
    assert_eq!(store.get("experimentState").await.unwrap(), None);
    assert_eq!(tracker.days_since_start().await.unwrap(), -1);

    clock.advance(Duration::days(3));
    let fresh = tracker.start(Some("new".into()), None).await.unwrap();
    assert_eq!(fresh.start_date, Some(clock.now()));
    assert!(!fresh.experiment_ended);
    assert!(!fresh.force_send_data);
    assert!(fresh
        .tasks_last_completion_date
        .values()
        .all(Option::is_none));
    assert_eq!(tracker.days_since_start().await.unwrap(), 0);
}
