//! Static study definition.
//!
//! A study is an ordered list of task descriptors plus global timing and
//! condition parameters. It is loaded once (JSON or TOML) and is immutable
//! for the process lifetime.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use super::state::{ParticipantState, StateKey};
use crate::error::DefinitionError;

/// Stable task identifier.
pub type TaskId = String;

/// Format of `NotificationTemplate::default_time` and stored notification times.
pub const NOTIFICATION_TIME_FORMAT: &str = "%H:%M";

/// Complete definition of one study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyDefinition {
    /// Human-readable name
    pub name: String,
    /// Total length in days. `None` means the study never ends on elapsed time.
    #[serde(default)]
    pub total_days: Option<i64>,
    /// Hour (0-23) at which the study day rolls over, e.g. 4 = 4am.
    #[serde(default)]
    pub cutoff_hour: u32,
    /// Destination for the participant info record sent at start.
    #[serde(default)]
    pub participant_info_datapipe_id: Option<String>,
    /// Route straight to the next open task after a submission.
    #[serde(default)]
    pub autoroute: bool,
    #[serde(default)]
    pub conditions: Option<ConditionBlock>,
    pub tasks: Vec<TaskDescriptor>,
    /// Initial consent-to-send value for new participants (default true).
    #[serde(default)]
    pub send_data: Option<bool>,
    #[serde(default)]
    pub end_text: Option<String>,
}

/// Experimental arms and how they are scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionBlock {
    pub conditions: Vec<String>,
    #[serde(rename = "repeatedMeasures", default)]
    pub repeated_measures: bool,
    /// Sorted ascending days on which the repeated-measures index advances.
    #[serde(default)]
    pub increase_on_days: Vec<i64>,
    /// Destination used by the external assignment service.
    #[serde(default)]
    pub datapipe_id: Option<String>,
}

/// Static definition of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Empty means every day.
    #[serde(default)]
    pub show_on_days: Vec<i64>,
    /// Empty means every condition.
    #[serde(default)]
    pub show_for_conditions: Vec<String>,
    #[serde(default)]
    pub allow_edit: bool,
    #[serde(default)]
    pub skip_if: Option<SkipRule>,
    #[serde(default)]
    pub notification: Option<NotificationTemplate>,
    /// Destination bucket for this task's data. `None` keeps it local.
    #[serde(default)]
    pub datapipe_id: Option<String>,
    /// Free-form parameters passed through to the task screen.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

/// The closed set of task kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Survey {
        #[serde(default)]
        questions: Vec<serde_json::Value>,
    },
    Screen {
        path_to_screen: String,
    },
    Web {
        url: String,
    },
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Survey { .. } => "survey",
            TaskKind::Screen { .. } => "screen",
            TaskKind::Web { .. } => "web",
        }
    }

    /// Shell route that renders a task of this kind.
    pub fn href(&self, task_id: &str) -> String {
        match self {
            TaskKind::Survey { .. } => format!("/survey?taskId={task_id}"),
            TaskKind::Screen { path_to_screen } => {
                let path = path_to_screen.trim_start_matches('/');
                format!("/{path}?taskId={task_id}")
            }
            TaskKind::Web { .. } => format!("/web?taskId={task_id}"),
        }
    }
}

/// Reminder template attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    #[serde(default)]
    pub prompt: Option<String>,
    /// Default reminder time, `HH:MM`.
    #[serde(default)]
    pub default_time: Option<String>,
}

/// Comparison used by [`SkipRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

/// Marks a task as done for today when participant state matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRule {
    pub state_key: StateKey,
    pub operator: Comparison,
    pub compare_value: serde_json::Value,
}

impl SkipRule {
    /// `None` when `state_key` does not resolve in `state`.
    pub fn evaluate(&self, state: &ParticipantState) -> Option<bool> {
        let value = state.lookup(&self.state_key)?;
        Some(match self.operator {
            Comparison::Equal => value == self.compare_value,
            Comparison::NotEqual => value != self.compare_value,
        })
    }
}

impl StudyDefinition {
    /// Parse and validate a JSON document.
    pub fn from_json_str(content: &str) -> Result<Self, DefinitionError> {
        let definition: Self = serde_json::from_str(content)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, DefinitionError> {
        let definition: Self = toml::from_str(content)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Load from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| DefinitionError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            _ => Err(DefinitionError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.cutoff_hour > 23 {
            return Err(invalid("cutoff_hour", format!("{} is not in 0-23", self.cutoff_hour)));
        }
        if let Some(total) = self.total_days {
            if total < 0 {
                return Err(invalid("total_days", format!("{total} is negative")));
            }
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(DefinitionError::DuplicateTask(task.id.clone()));
            }
            if let Some(time) = task
                .notification
                .as_ref()
                .and_then(|n| n.default_time.as_deref())
            {
                NaiveTime::parse_from_str(time, NOTIFICATION_TIME_FORMAT).map_err(|e| {
                    invalid(
                        &format!("tasks.{}.notification.default_time", task.id),
                        format!("'{time}': {e}"),
                    )
                })?;
            }
        }

        if let Some(block) = &self.conditions {
            if block.conditions.is_empty() {
                return Err(invalid("conditions.conditions", "no conditions listed".into()));
            }
            if block.repeated_measures && block.increase_on_days.is_empty() {
                return Err(invalid(
                    "conditions.increase_on_days",
                    "repeated measures design needs at least one threshold".into(),
                ));
            }
            if block.increase_on_days.windows(2).any(|w| w[0] > w[1]) {
                return Err(invalid(
                    "conditions.increase_on_days",
                    "thresholds must be sorted ascending".into(),
                ));
            }
        }

        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Whether the study records a day number with each submission.
    pub fn is_longitudinal(&self) -> bool {
        self.total_days.is_some_and(|days| days > 0)
    }
}

fn invalid(field: &str, message: String) -> DefinitionError {
    DefinitionError::InvalidValue {
        field: field.to_string(),
        message,
    }
}
