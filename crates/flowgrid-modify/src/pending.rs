//! The table of in-flight modifications.
//!
//! Each modification gets an id from a monotonically increasing counter
//! and stays in the table until every target attempt acknowledged it, a
//! target declined it, or its deadline passed. Any number of
//! modifications may be in flight at once.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use flow_core::{ExecutionAttemptId, ModificationId};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Pause,
    Resume,
    Trigger,
    Insert,
    Grow,
    Restart,
}

impl fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModificationKind::Pause => "pause",
            ModificationKind::Resume => "resume",
            ModificationKind::Trigger => "trigger",
            ModificationKind::Insert => "insert",
            ModificationKind::Grow => "grow",
            ModificationKind::Restart => "restart",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct PendingModification {
    pub id: ModificationId,
    pub kind: ModificationKind,
    /// Unix epoch millis at creation.
    pub timestamp: u64,
    pub targets: BTreeSet<ExecutionAttemptId>,
    pub acknowledged: BTreeSet<ExecutionAttemptId>,
    pub deadline: Instant,
}

impl PendingModification {
    pub fn new(
        id: ModificationId,
        kind: ModificationKind,
        timestamp: u64,
        targets: impl IntoIterator<Item = ExecutionAttemptId>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            kind,
            timestamp,
            targets: targets.into_iter().collect(),
            acknowledged: BTreeSet::new(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn missing(&self) -> Vec<ExecutionAttemptId> {
        self.targets.difference(&self.acknowledged).copied().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.targets.is_subset(&self.acknowledged)
    }
}

/// How a modification left the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModificationOutcome {
    Completed {
        id: ModificationId,
        kind: ModificationKind,
    },
    Declined {
        id: ModificationId,
        attempt: ExecutionAttemptId,
        reason: String,
    },
    /// Deadline passed or a control call failed before every target
    /// acknowledged.
    Incomplete {
        id: ModificationId,
        kind: ModificationKind,
        missing: Vec<ExecutionAttemptId>,
    },
}

impl ModificationOutcome {
    pub fn id(&self) -> ModificationId {
        match self {
            ModificationOutcome::Completed { id, .. }
            | ModificationOutcome::Declined { id, .. }
            | ModificationOutcome::Incomplete { id, .. } => *id,
        }
    }
}

/// What an acknowledgement did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// No modification with that id is pending.
    UnknownModification,
    /// The attempt is not among the targets; nothing was recorded.
    NotATarget,
    /// Recorded; other targets are still missing.
    Recorded { kind: ModificationKind },
    /// Recorded and complete; the modification left the table.
    Completed(ModificationOutcome),
}

impl Acknowledgement {
    /// Kind of the modification the acknowledgement counted for.
    pub fn kind(&self) -> Option<ModificationKind> {
        match self {
            Acknowledgement::Recorded { kind }
            | Acknowledgement::Completed(ModificationOutcome::Completed { kind, .. }) => Some(*kind),
            _ => None,
        }
    }
}

pub struct PendingTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ModificationId, PendingModification>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<ModificationId, PendingModification>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new modification and return its id.
    pub fn begin(
        &self,
        kind: ModificationKind,
        timestamp: u64,
        targets: impl IntoIterator<Item = ExecutionAttemptId>,
        timeout: Duration,
    ) -> ModificationId {
        let id = ModificationId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pending = PendingModification::new(id, kind, timestamp, targets, timeout);
        debug!(modification = %id, %kind, targets = pending.targets.len(), "modification pending");
        self.entries().insert(id, pending);
        id
    }

    pub fn insert(&self, pending: PendingModification) {
        self.entries().insert(pending.id, pending);
    }

    pub fn contains(&self, id: ModificationId) -> bool {
        self.entries().contains_key(&id)
    }

    pub fn get(&self, id: ModificationId) -> Option<PendingModification> {
        self.entries().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Pending modifications ordered by id.
    pub fn snapshot(&self) -> Vec<PendingModification> {
        let mut all: Vec<_> = self.entries().values().cloned().collect();
        all.sort_by_key(|p| p.id);
        all
    }

    /// Record an acknowledgement from a target attempt. A complete
    /// modification is removed.
    pub fn acknowledge(&self, id: ModificationId, attempt: ExecutionAttemptId) -> Acknowledgement {
        let mut entries = self.entries();
        let Some(pending) = entries.get_mut(&id) else {
            return Acknowledgement::UnknownModification;
        };
        if !pending.targets.contains(&attempt) {
            debug!(modification = %id, %attempt, "ignoring acknowledgement from non-target attempt");
            return Acknowledgement::NotATarget;
        }
        pending.acknowledged.insert(attempt);
        let kind = pending.kind;
        if !pending.is_complete() {
            return Acknowledgement::Recorded { kind };
        }
        entries.remove(&id);
        info!(modification = %id, %kind, "modification complete");
        Acknowledgement::Completed(ModificationOutcome::Completed { id, kind })
    }

    /// Remove a declined modification. `None` when `id` is not pending.
    pub fn decline(
        &self,
        id: ModificationId,
        attempt: ExecutionAttemptId,
        reason: &str,
    ) -> Option<ModificationOutcome> {
        let done = self.entries().remove(&id)?;
        warn!(modification = %id, kind = %done.kind, %attempt, reason, "modification declined");
        Some(ModificationOutcome::Declined {
            id,
            attempt,
            reason: reason.to_string(),
        })
    }

    /// Remove a modification that can no longer complete.
    pub fn abandon(&self, id: ModificationId) -> Option<ModificationOutcome> {
        let done = self.entries().remove(&id)?;
        let missing = done.missing();
        warn!(modification = %id, kind = %done.kind, missing = missing.len(), "modification incomplete");
        Some(ModificationOutcome::Incomplete {
            id,
            kind: done.kind,
            missing,
        })
    }

    /// Remove every modification whose deadline is before `now`.
    pub fn expire_overdue(&self, now: Instant) -> Vec<ModificationOutcome> {
        let overdue: Vec<ModificationId> = self
            .entries()
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.id)
            .collect();
        let mut outcomes: Vec<_> = overdue.into_iter().filter_map(|id| self.abandon(id)).collect();
        outcomes.sort_by_key(ModificationOutcome::id);
        outcomes
    }
}
