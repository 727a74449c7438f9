//! Condition assignment.
//!
//! Randomization is owned by an external assignment service. The core only
//! consumes its answer through [`ConditionAssigner`].

use async_trait::async_trait;

use super::definition::ConditionBlock;
use super::state::ConditionAssignment;

/// Assignment service failure. Never fatal to `start()`.
#[derive(Debug, thiserror::Error)]
#[error("Condition assignment failed: {0}")]
pub struct AssignmentError(pub String);

/// Source of a participant's condition assignment.
#[async_trait]
pub trait ConditionAssigner: Send + Sync {
    async fn assign(&self, block: &ConditionBlock) -> Result<ConditionAssignment, AssignmentError>;
}

/// Assignment following the definition's own order: the condition list as
/// the repeated-measures order, or its first entry.
pub fn definition_order(block: &ConditionBlock) -> Result<ConditionAssignment, AssignmentError> {
    if block.repeated_measures {
        return Ok(ConditionAssignment::Repeated {
            condition_order: block.conditions.clone(),
        });
    }
    block
        .conditions
        .first()
        .map(|c| ConditionAssignment::Independent {
            assigned_condition: c.clone(),
        })
        .ok_or_else(|| AssignmentError("study definition lists no conditions".into()))
}

/// Assigns in definition order. Used when no assignment service is wired in
/// and as the fallback when the service fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefinitionOrderAssigner;

#[async_trait]
impl ConditionAssigner for DefinitionOrderAssigner {
    async fn assign(&self, block: &ConditionBlock) -> Result<ConditionAssignment, AssignmentError> {
        definition_order(block)
    }
}

/// Always returns the same assignment.
#[derive(Debug, Clone)]
pub struct FixedAssigner(pub ConditionAssignment);

#[async_trait]
impl ConditionAssigner for FixedAssigner {
    async fn assign(&self, _block: &ConditionBlock) -> Result<ConditionAssignment, AssignmentError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(repeated: bool) -> ConditionBlock {
        ConditionBlock {
            conditions: vec!["A".into(), "B".into()],
            repeated_measures: repeated,
            increase_on_days: vec![3],
            datapipe_id: None,
        }
    }

    #[tokio::test]
    async fn test_definition_order_independent() {
        let assignment = DefinitionOrderAssigner.assign(&block(false)).await.unwrap();
        assert_eq!(
            assignment,
            ConditionAssignment::Independent {
                assigned_condition: "A".into()
            }
        );
    }

    #[tokio::test]
    async fn test_definition_order_repeated() {
        let assignment = DefinitionOrderAssigner.assign(&block(true)).await.unwrap();
        assert_eq!(
            assignment,
            ConditionAssignment::Repeated {
                condition_order: vec!["A".into(), "B".into()]
            }
        );
    }

    #[test]
    fn test_definition_order_without_conditions() {
        let mut empty = block(false);
        empty.conditions.clear();
        assert!(definition_order(&empty).is_err());
    }
}
