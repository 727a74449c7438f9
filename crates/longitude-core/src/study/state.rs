//! Persisted participant state.
//!
//! `ParticipantState` is the single source of truth for one participant.
//! It is stored as one JSON document and is loaded, mutated and saved as a
//! whole by every state-changing operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::definition::TaskId;
use crate::error::DefinitionError;

/// Condition assignment made at study start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "conditionType")]
pub enum ConditionAssignment {
    /// One condition for the whole study.
    #[serde(rename = "independent")]
    Independent {
        #[serde(rename = "assignedCondition")]
        assigned_condition: String,
    },
    /// Conditions visited in order, advancing on the definition's thresholds.
    #[serde(rename = "repeated")]
    Repeated {
        #[serde(rename = "repeatedMeasuresConditionOrder")]
        condition_order: Vec<String>,
    },
}

impl ConditionAssignment {
    /// JSON summary used in the participant info record.
    pub fn summary(&self) -> Value {
        match self {
            ConditionAssignment::Independent { assigned_condition } => {
                Value::String(assigned_condition.clone())
            }
            ConditionAssignment::Repeated { condition_order } => Value::Array(
                condition_order
                    .iter()
                    .map(|c| Value::String(c.clone()))
                    .collect(),
            ),
        }
    }
}

/// Everything persisted about one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    /// Set once at study start.
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub participant_id: Option<String>,
    /// Consent to send data. `None` is treated as consent.
    #[serde(default)]
    pub send_data: Option<bool>,
    #[serde(default)]
    pub tasks_last_completion_date: BTreeMap<TaskId, Option<DateTime<Utc>>>,
    /// Reminder time per task, `HH:MM`.
    #[serde(default)]
    pub notification_times: BTreeMap<TaskId, Option<String>>,
    #[serde(default)]
    pub participant_variables: serde_json::Map<String, Value>,
    #[serde(default)]
    pub experiment_ended: bool,
    /// Bypass send-after embargoes on the next drains.
    #[serde(default)]
    pub force_send_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionAssignment>,
}

impl ParticipantState {
    pub fn last_completion(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.tasks_last_completion_date
            .get(task_id)
            .copied()
            .flatten()
    }

    /// Resolve a state key to its current value.
    pub fn lookup(&self, key: &StateKey) -> Option<Value> {
        match key {
            StateKey::StartDate => self.start_date.map(|d| Value::String(d.to_rfc3339())),
            StateKey::ParticipantId => self.participant_id.clone().map(Value::String),
            StateKey::SendData => self.send_data.map(Value::Bool),
            StateKey::ExperimentEnded => Some(Value::Bool(self.experiment_ended)),
            StateKey::ForceSendData => Some(Value::Bool(self.force_send_data)),
            StateKey::TaskCompletion(task_id) => self
                .tasks_last_completion_date
                .get(task_id)
                .map(|d| d.map_or(Value::Null, |d| Value::String(d.to_rfc3339()))),
            StateKey::NotificationTime(task_id) => self
                .notification_times
                .get(task_id)
                .map(|t| t.clone().map_or(Value::Null, Value::String)),
            StateKey::ParticipantVariable(path) => {
                let (first, rest) = path.split_first()?;
                let mut current = self.participant_variables.get(first)?;
                for segment in rest {
                    current = match current {
                        Value::Object(map) => map.get(segment)?,
                        Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                        _ => return None,
                    };
                }
                Some(current.clone())
            }
        }
    }
}

/// Typed path into [`ParticipantState`].
///
/// Known fields are closed variants; only participant variables stay
/// dynamic. Written as dotted strings in study definitions, e.g.
/// `sendData` or `participantVariables.device.deviceType`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StateKey {
    StartDate,
    ParticipantId,
    SendData,
    ExperimentEnded,
    ForceSendData,
    TaskCompletion(TaskId),
    NotificationTime(TaskId),
    ParticipantVariable(Vec<String>),
}

impl FromStr for StateKey {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || DefinitionError::UnknownStateKey(s.to_string());
        let mut parts = s.split('.');
        let head = parts.next().ok_or_else(unknown)?;
        let rest: Vec<String> = parts.map(str::to_string).collect();
        if rest.iter().any(String::is_empty) {
            return Err(unknown());
        }

        let single = |rest: Vec<String>| -> Result<String, DefinitionError> {
            match <[String; 1]>::try_from(rest) {
                Ok([id]) => Ok(id),
                Err(_) => Err(unknown()),
            }
        };

        match head {
            "startDate" if rest.is_empty() => Ok(StateKey::StartDate),
            "participantId" if rest.is_empty() => Ok(StateKey::ParticipantId),
            "sendData" if rest.is_empty() => Ok(StateKey::SendData),
            "experimentEnded" if rest.is_empty() => Ok(StateKey::ExperimentEnded),
            "forceSendData" if rest.is_empty() => Ok(StateKey::ForceSendData),
            "tasksLastCompletionDate" => single(rest).map(StateKey::TaskCompletion),
            "notificationTimes" => single(rest).map(StateKey::NotificationTime),
            "participantVariables" if !rest.is_empty() => Ok(StateKey::ParticipantVariable(rest)),
            _ => Err(unknown()),
        }
    }
}

impl TryFrom<String> for StateKey {
    type Error = DefinitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKey::StartDate => f.write_str("startDate"),
            StateKey::ParticipantId => f.write_str("participantId"),
            StateKey::SendData => f.write_str("sendData"),
            StateKey::ExperimentEnded => f.write_str("experimentEnded"),
            StateKey::ForceSendData => f.write_str("forceSendData"),
            StateKey::TaskCompletion(id) => write!(f, "tasksLastCompletionDate.{id}"),
            StateKey::NotificationTime(id) => write!(f, "notificationTimes.{id}"),
            StateKey::ParticipantVariable(path) => {
                write!(f, "participantVariables.{}", path.join("."))
            }
        }
    }
}

impl From<StateKey> for String {
    fn from(key: StateKey) -> Self {
        key.to_string()
    }
}
