//! Execution attempt lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one execution attempt.
///
/// `Paused` is a voluntary sub-state of `Running`: a paused attempt keeps
/// its slot, channels and buffers and returns to `Running` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Created,
    Scheduled,
    Deploying,
    Running,
    Paused,
    Canceling,
    Canceled,
    Finished,
    Failed,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 9] = [
        ExecutionState::Created,
        ExecutionState::Scheduled,
        ExecutionState::Deploying,
        ExecutionState::Running,
        ExecutionState::Paused,
        ExecutionState::Canceling,
        ExecutionState::Canceled,
        ExecutionState::Finished,
        ExecutionState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Canceled | ExecutionState::Finished | ExecutionState::Failed
        )
    }

    /// Whether the attempt is live on a worker and can take control calls.
    pub fn is_active(self) -> bool {
        matches!(self, ExecutionState::Running | ExecutionState::Paused)
    }

    fn ordinal(self) -> usize {
        self as usize
    }

    /// Summarize the states of a replica group for display.
    ///
    /// Any failed replica makes the group failed; otherwise canceling beats
    /// canceled, canceled beats running, running beats paused. The group is
    /// finished only once every replica finished, and everything else
    /// collapses to created.
    pub fn aggregate<I>(states: I, parallelism: usize) -> ExecutionState
    where
        I: IntoIterator<Item = ExecutionState>,
    {
        let mut counts = [0usize; ExecutionState::ALL.len()];
        for state in states {
            counts[state.ordinal()] += 1;
        }
        let count = |s: ExecutionState| counts[s.ordinal()];

        if count(ExecutionState::Failed) > 0 {
            ExecutionState::Failed
        } else if count(ExecutionState::Canceling) > 0 {
            ExecutionState::Canceling
        } else if count(ExecutionState::Canceled) > 0 {
            ExecutionState::Canceled
        } else if count(ExecutionState::Running) > 0 {
            ExecutionState::Running
        } else if count(ExecutionState::Paused) > 0 {
            ExecutionState::Paused
        } else if count(ExecutionState::Finished) > 0 {
            if count(ExecutionState::Finished) == parallelism {
                ExecutionState::Finished
            } else {
                ExecutionState::Running
            }
        } else {
            ExecutionState::Created
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionState::Created => "CREATED",
            ExecutionState::Scheduled => "SCHEDULED",
            ExecutionState::Deploying => "DEPLOYING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Paused => "PAUSED",
            ExecutionState::Canceling => "CANCELING",
            ExecutionState::Canceled => "CANCELED",
            ExecutionState::Finished => "FINISHED",
            ExecutionState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn failed_dominates() {
        assert_eq!(ExecutionState::aggregate([Running, Failed, Finished], 3), Failed);
    }

    #[test]
    fn paused_is_below_running() {
        assert_eq!(ExecutionState::aggregate([Running, Paused], 2), Running);
        assert_eq!(ExecutionState::aggregate([Paused, Paused], 2), Paused);
    }

    #[test]
    fn finished_only_when_all_finished() {
        assert_eq!(ExecutionState::aggregate([Finished, Finished], 2), Finished);
        assert_eq!(ExecutionState::aggregate([Finished, Created], 2), Running);
    }

    #[test]
    fn everything_else_is_created() {
        assert_eq!(ExecutionState::aggregate([Scheduled, Deploying], 2), Created);
        assert_eq!(ExecutionState::aggregate([], 0), Created);
    }

    #[test]
    fn display_is_upper_case() {
        assert_eq!(Paused.to_string(), "PAUSED");
    }
}
