//! Current-condition resolution.

use serde::Serialize;
use tracing::error;

use super::definition::StudyDefinition;
use super::state::{ConditionAssignment, ParticipantState};

/// Reported instead of a real condition when state and definition disagree.
pub const ERROR_CONDITION: &str = "error_condition";

/// Condition in effect on a given study day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConditionResolution {
    pub condition: Option<String>,
    pub index: Option<usize>,
}

impl ConditionResolution {
    fn degraded() -> Self {
        Self {
            condition: Some(ERROR_CONDITION.to_string()),
            index: Some(0),
        }
    }
}

/// Index into a repeated-measures order: the number of thresholds reached,
/// clamped to the last condition.
pub fn repeated_measures_index(thresholds: &[i64], experiment_day: i64, order_len: usize) -> usize {
    let reached = thresholds.iter().filter(|&&day| day <= experiment_day).count();
    reached.min(order_len.saturating_sub(1))
}

/// Resolve the condition for `experiment_day`.
///
/// Never fails: a state/definition mismatch is logged and degrades to
/// [`ERROR_CONDITION`].
pub fn resolve_condition(
    definition: &StudyDefinition,
    state: &ParticipantState,
    experiment_day: i64,
) -> ConditionResolution {
    let (Some(block), Some(assignment)) = (&definition.conditions, &state.condition) else {
        return ConditionResolution::default();
    };

    match assignment {
        ConditionAssignment::Independent { assigned_condition } => ConditionResolution {
            condition: Some(assigned_condition.clone()),
            index: Some(0),
        },
        ConditionAssignment::Repeated { condition_order } => {
            if !block.repeated_measures {
                error!("Participant state is repeated-measures but the study definition is not");
                return ConditionResolution::degraded();
            }
            if condition_order.is_empty() {
                error!("Repeated-measures condition order is empty");
                return ConditionResolution::degraded();
            }

            let index = repeated_measures_index(
                &block.increase_on_days,
                experiment_day,
                condition_order.len(),
            );
            ConditionResolution {
                condition: Some(condition_order[index].clone()),
                index: Some(index),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::definition::ConditionBlock;
    use std::collections::BTreeMap;

    fn definition(repeated: bool) -> StudyDefinition {
        StudyDefinition {
            name: "conditions".into(),
            total_days: None,
            cutoff_hour: 0,
            participant_info_datapipe_id: None,
            autoroute: false,
            conditions: Some(ConditionBlock {
                conditions: vec!["A".into(), "B".into(), "C".into()],
                repeated_measures: repeated,
                increase_on_days: if repeated { vec![2, 6] } else { vec![] },
                datapipe_id: None,
            }),
            tasks: vec![],
            send_data: None,
            end_text: None,
        }
    }

    fn state(condition: Option<ConditionAssignment>) -> ParticipantState {
        ParticipantState {
            start_date: None,
            participant_id: None,
            send_data: None,
            tasks_last_completion_date: BTreeMap::new(),
            notification_times: BTreeMap::new(),
            participant_variables: serde_json::Map::new(),
            experiment_ended: false,
            force_send_data: false,
            condition,
        }
    }

    fn repeated() -> Option<ConditionAssignment> {
        Some(ConditionAssignment::Repeated {
            condition_order: vec!["A".into(), "B".into(), "C".into()],
        })
    }

    #[test]
    fn test_repeated_measures_schedule() {
        let def = definition(true);
        let st = state(repeated());
        let expected = [(0, "A", 0), (1, "A", 0), (2, "B", 1), (5, "B", 1), (6, "C", 2), (100, "C", 2)];

        for (day, condition, index) in expected {
            let resolved = resolve_condition(&def, &st, day);
            assert_eq!(resolved.condition.as_deref(), Some(condition), "day {day}");
            assert_eq!(resolved.index, Some(index), "day {day}");
        }
    }

    #[test]
    fn test_index_never_decreases() {
        let mut previous = 0;
        for day in -1..50 {
            let index = repeated_measures_index(&[2, 6, 9], day, 3);
            assert!(index >= previous);
            assert!(index <= 2);
            previous = index;
        }
    }

    #[test]
    fn test_independent_condition_is_constant() {
        let def = definition(false);
        let st = state(Some(ConditionAssignment::Independent {
            assigned_condition: "B".into(),
        }));
        for day in [0, 3, 40] {
            let resolved = resolve_condition(&def, &st, day);
            assert_eq!(resolved.condition.as_deref(), Some("B"));
            assert_eq!(resolved.index, Some(0));
        }
    }

    #[test]
    fn test_mismatch_degrades_to_error_condition() {
        let def = definition(false);
        let resolved = resolve_condition(&def, &state(repeated()), 3);
        assert_eq!(resolved.condition.as_deref(), Some(ERROR_CONDITION));
    }

    #[test]
    fn test_no_condition_block_or_assignment() {
        let mut def = definition(true);
        assert_eq!(resolve_condition(&def, &state(None), 3), ConditionResolution::default());

        def.conditions = None;
        assert_eq!(resolve_condition(&def, &state(repeated()), 3), ConditionResolution::default());
    }
}
