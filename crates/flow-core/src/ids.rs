//! Opaque identifiers.
//!
//! Every identifier is a `u64` newtype. Generated identifiers come from a
//! single process-wide counter that starts above `2^32`, so identifiers
//! built with `from_raw` in tests never collide with generated ones.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_ID: AtomicU64 = AtomicU64::new(1 << 32);

fn next_raw() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Allocate a fresh, process-unique identifier.
            pub fn generate() -> Self {
                Self(next_raw())
            }

            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies the job that owns an execution graph.
    JobId,
    "job"
);

define_id!(
    /// Identifies an operator vertex template (and its replica group).
    JobVertexId,
    "vertex"
);

define_id!(
    /// Identifies a produced dataset and its runtime intermediate result.
    IntermediateDataSetId,
    "dataset"
);

define_id!(
    /// Identifies one concrete execution attempt of a task replica.
    ExecutionAttemptId,
    "attempt"
);

define_id!(
    /// Identifies one partition of an intermediate result.
    PartitionId,
    "partition"
);

define_id!(
    /// Identifies an in-flight topology modification.
    ///
    /// Unlike the other identifiers these are not drawn from the global
    /// counter: each coordinator hands them out from its own monotonically
    /// increasing sequence.
    ModificationId,
    "modification"
);
