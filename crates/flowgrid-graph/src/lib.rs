//! flowgrid-graph — the runtime execution graph of a running job.
//!
//! Static operator templates (`JobVertex`) are instantiated into replica
//! groups (`ExecutionJobVertex`), each owning an append-only arena of task
//! replicas (`ExecutionVertex`) whose current `Execution` attempt is the
//! handle used for remote control.
//!
//! # Architecture
//!
//! ```text
//! ExecutionGraph
//!   ├── Mutex<GraphState>            (single mutation lock per job)
//!   │   ├── tasks: vertex id → ExecutionJobVertex
//!   │   │   └── replicas[ordinal] → ExecutionVertex → Arc<Execution>
//!   │   ├── results: dataset id → IntermediateResult → partitions
//!   │   ├── creation order
//!   │   └── registered attempts
//!   ├── status + failure cause
//!   └── SlotProvider → Slot → TaskGateway (remote worker)
//! ```
//!
//! All structural changes (attach, splice, grow) run with the mutation
//! lock held, so `parallelism == replicas.len()` and
//! `partitions == parallelism` are never observed half-applied.

pub mod error;
pub mod execution;
pub mod gateway;
pub mod graph;
pub mod job_graph;
pub mod job_vertex;
pub mod messages;
pub mod result;
pub mod slot;
pub mod state;
pub mod vertex;

#[cfg(test)]
mod testing;

pub use error::{GraphError, GraphResult};
pub use execution::Execution;
pub use gateway::{
    GatewayError, GatewayFuture, InputGateDescriptor, TaskDeploymentDescriptor, TaskGateway,
};
pub use graph::{ExecutionGraph, FailureCause, GraphState, JobStatus, PendingDeployment, RegistrySnapshot};
pub use job_graph::{DistributionPattern, IntermediateDataSet, JobEdge, JobGraph, JobVertex, ResultPartitionType};
pub use job_vertex::{ConnectMode, ExecutionJobVertex};
pub use messages::{AcknowledgeModification, DeclineModification, ModificationResponse, TaskStateUpdate};
pub use result::{ConsumerRef, IntermediateResult, IntermediateResultPartition};
pub use slot::{Slot, SlotPool, SlotProvider, SlotRequest};
pub use state::ExecutionState;
pub use vertex::{ExecutionEdge, ExecutionVertex};
