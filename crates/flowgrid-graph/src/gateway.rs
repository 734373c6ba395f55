//! Gateway to the worker that hosts an execution attempt.
//!
//! Every control operation the coordinator performs on a running attempt
//! goes through a `TaskGateway`. Calls return boxed futures so the trait
//! stays object safe; callers bound them with their own timeout and must
//! assume a response may never arrive.

use std::future::Future;
use std::pin::Pin;

use flow_core::{
    BlobSet, ExecutionAttemptId, IntermediateDataSetId, JobId, JobVertexId, ModificationId,
    PartitionId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed future returned by gateway calls.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("attempt {0} is not known to the worker")]
    UnknownAttempt(ExecutionAttemptId),

    #[error("worker declined: {0}")]
    Declined(String),

    #[error("worker is missing {} blob(s) required by the task", .0.len())]
    MissingBlobs(Vec<flow_core::BlobKey>),

    #[error("no operator registered for invokable '{0}'")]
    UnknownInvokable(String),

    #[error("worker unreachable: {0}")]
    Unreachable(String),
}

/// Where one input of a task reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputGateDescriptor {
    pub result_id: IntermediateDataSetId,
    pub consumer_index: usize,
    pub partitions: Vec<PartitionId>,
}

/// Everything a worker needs to start an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDeploymentDescriptor {
    pub job_id: JobId,
    pub vertex_id: JobVertexId,
    pub attempt_id: ExecutionAttemptId,
    pub task_name: String,
    pub subtask_index: usize,
    pub parallelism: usize,
    pub invokable: String,
    /// Partitions this attempt writes, one per produced result.
    pub produced_partitions: Vec<(IntermediateDataSetId, PartitionId)>,
    pub input_gates: Vec<InputGateDescriptor>,
    pub blob_keys: BlobSet,
}

/// Control surface of a worker, as seen from the coordinator.
pub trait TaskGateway: Send + Sync {
    /// Worker location, used for co-location preferences.
    fn location(&self) -> &str;

    fn submit_task(&self, descriptor: TaskDeploymentDescriptor) -> GatewayFuture<'_, ()>;

    fn cancel_task(&self, attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()>;

    /// Ask the attempt's run loop to pause at its next iteration boundary.
    fn pause_task(&self, attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()>;

    fn resume_task(&self, attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()>;

    /// Deliver a modification trigger. Completion is reported separately
    /// through `AcknowledgeModification` / `DeclineModification` messages.
    fn trigger_modification(
        &self,
        attempt: ExecutionAttemptId,
        modification: ModificationId,
        timestamp: u64,
        target_vertices: Vec<JobVertexId>,
    ) -> GatewayFuture<'_, ()>;
}
