//! Control response messages sent by workers back to the coordinator.
//!
//! Acknowledgements and declines are correlated by modification id only;
//! the other fields are diagnostic. Task state updates report attempts
//! whose run loop ended on its own, keyed by attempt id.

use std::fmt;

use flow_core::{ExecutionAttemptId, JobId, ModificationId};
use serde::{Deserialize, Serialize};

use crate::state::ExecutionState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeModification {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub modification_id: ModificationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclineModification {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub modification_id: ModificationId,
    pub reason: String,
}

/// A run loop left on its own, e.g. its input ended or the operator
/// failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateUpdate {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub state: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModificationResponse {
    Acknowledge(AcknowledgeModification),
    Decline(DeclineModification),
    TaskState(TaskStateUpdate),
}

impl ModificationResponse {
    /// The modification this response answers; `None` for task state
    /// updates.
    pub fn modification_id(&self) -> Option<ModificationId> {
        match self {
            ModificationResponse::Acknowledge(a) => Some(a.modification_id),
            ModificationResponse::Decline(d) => Some(d.modification_id),
            ModificationResponse::TaskState(_) => None,
        }
    }
}

impl fmt::Display for AcknowledgeModification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AcknowledgeModification {} from {} ({})",
            self.modification_id, self.attempt_id, self.job_id
        )
    }
}

impl fmt::Display for DeclineModification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeclineModification {} from {} ({}): {}",
            self.modification_id, self.attempt_id, self.job_id, self.reason
        )
    }
}

impl fmt::Display for TaskStateUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskState {} is {} ({})", self.attempt_id, self.state, self.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_carries_no_modification_id() {
        let update = ModificationResponse::TaskState(TaskStateUpdate {
            job_id: JobId::from_raw(1),
            attempt_id: ExecutionAttemptId::from_raw(2),
            state: ExecutionState::Finished,
        });
        assert_eq!(update.modification_id(), None);

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "task_state");
        let back: ModificationResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, update);
    }
}
