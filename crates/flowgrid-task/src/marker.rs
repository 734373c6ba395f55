//! The modification marker carried through data channels.

use std::collections::BTreeSet;
use std::fmt;

use flow_core::{ExecutionAttemptId, ModificationId};

/// Injected by a source replica when a modification is triggered and
/// forwarded downstream by every intermediate hop. Replicas running one of
/// the target attempts resume when they observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationMarker {
    modification_id: ModificationId,
    timestamp: u64,
    targets: BTreeSet<ExecutionAttemptId>,
}

impl ModificationMarker {
    pub fn new(
        modification_id: ModificationId,
        timestamp: u64,
        targets: impl IntoIterator<Item = ExecutionAttemptId>,
    ) -> Self {
        Self {
            modification_id,
            timestamp,
            targets: targets.into_iter().collect(),
        }
    }

    pub fn modification_id(&self) -> ModificationId {
        self.modification_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn targets(&self) -> &BTreeSet<ExecutionAttemptId> {
        &self.targets
    }

    pub fn is_target(&self, attempt: ExecutionAttemptId) -> bool {
        self.targets.contains(&attempt)
    }
}

impl fmt::Display for ModificationMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.targets.iter().map(ToString::to_string).collect();
        write!(
            f,
            "ModificationMarker with ids: {} @ {} - {}",
            self.modification_id,
            ids.join(","),
            self.timestamp
        )
    }
}
