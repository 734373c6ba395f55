//! flowgrid-modify — live modification of a running job.
//!
//! # Architecture
//!
//! ```text
//! flowd modify <command> [args]
//!        │
//!        ▼
//! ModifyOptions ──parse──► ModifyCommand
//!        │
//!        ▼
//! ModificationCoordinator
//!   ├── ExecutionGraph        role lookup, splice, grow, schedule, deploy
//!   ├── PendingTable          modification id → targets / acknowledged
//!   ├── blob keys             resources shipped with new operators
//!   └── run()  ◄──────────── ModificationResponse from workers
//! ```
//!
//! Pause and resume are synchronous control calls. A trigger injects a
//! modification marker at the source replicas; it completes once every
//! target attempt acknowledged the marker. Insert and grow change the
//! graph under its mutation lock, then schedule and deploy the new
//! replicas. A restart cancels a group and deploys fresh attempts into
//! the same result partitions. Workers also report attempts whose run
//! loop ended, which the coordinator records in the graph.

pub mod coordinator;
pub mod error;
pub mod options;
pub mod pending;
pub mod plan;

pub use coordinator::{
    ControlReport, GrowReport, INSERTED_ROLE, InsertReport, ModificationCoordinator, ModifyOutcome,
    RestartReport,
};
pub use error::{ModifyError, ModifyResult};
pub use options::{ModifyCommand, ModifyOptions};
pub use pending::{Acknowledgement, ModificationKind, ModificationOutcome, PendingModification, PendingTable};
