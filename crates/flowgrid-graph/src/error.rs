//! Execution graph error types.

use std::time::Duration;

use flow_core::{ExecutionAttemptId, IntermediateDataSetId, JobVertexId};
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::state::ExecutionState;

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("encountered two job vertices with id {0}")]
    DuplicateVertex(JobVertexId),

    #[error("encountered two intermediate results with id {0}")]
    DuplicateResult(IntermediateDataSetId),

    #[error(
        "cannot connect input {input} of vertex {vertex}: no intermediate result found for {result}"
    )]
    MissingPredecessor {
        vertex: JobVertexId,
        input: usize,
        result: IntermediateDataSetId,
    },

    #[error("intermediate result {result} has {partitions} partitions but its producer has parallelism {parallelism}")]
    PartitionMismatch {
        result: IntermediateDataSetId,
        partitions: usize,
        parallelism: usize,
    },

    #[error("intermediate result {result} assigned consumer index {found}, expected {expected}")]
    ConsumerIndexMismatch {
        result: IntermediateDataSetId,
        expected: usize,
        found: usize,
    },

    #[error("vertex '{vertex}' has {found} {what}, expected {expected}")]
    UnexpectedShape {
        vertex: String,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("vertex '{vertex}' is already at its max parallelism {max}")]
    MaxParallelismExceeded { vertex: String, max: usize },

    #[error("max parallelism {0} is out of bounds (1..=32768)")]
    InvalidMaxParallelism(usize),

    #[error("intermediate result {0} is not registered")]
    UnknownResult(IntermediateDataSetId),

    #[error("vertex '{0}' has no parallelism and no default was given")]
    InvalidParallelism(String),

    #[error("vertex '{vertex}' has no replica {ordinal}")]
    UnknownReplica { vertex: String, ordinal: usize },

    #[error("unknown job vertex: {0}")]
    UnknownVertex(JobVertexId),

    #[error("unknown job vertex name: {0}")]
    UnknownVertexName(String),

    #[error("no operator matches role '{0}'")]
    RoleNotFound(String),

    #[error("no slot available for '{vertex}' subtask {subtask}")]
    NoResourceAvailable { vertex: String, subtask: usize },

    #[error("attempt {0} has no assigned slot")]
    NotDeployed(ExecutionAttemptId),

    #[error("cannot {operation} attempt {attempt} in state {state}")]
    IllegalState {
        attempt: ExecutionAttemptId,
        state: ExecutionState,
        operation: &'static str,
    },

    #[error("{operation} of attempt {attempt} timed out after {timeout:?}")]
    ControlTimeout {
        attempt: ExecutionAttemptId,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{operation} of attempt {attempt} failed: {source}")]
    Gateway {
        attempt: ExecutionAttemptId,
        operation: &'static str,
        #[source]
        source: GatewayError,
    },
}

impl GraphError {
    /// Structural violations mean the graph model itself can no longer be
    /// trusted; they always escalate to a global job failure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            GraphError::DuplicateVertex(_)
                | GraphError::DuplicateResult(_)
                | GraphError::MissingPredecessor { .. }
                | GraphError::PartitionMismatch { .. }
                | GraphError::ConsumerIndexMismatch { .. }
                | GraphError::UnexpectedShape { .. }
                | GraphError::UnknownResult(_)
                | GraphError::MaxParallelismExceeded { .. }
        )
    }

    /// A vertex, replica, or role that should exist could not be found.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            GraphError::UnknownVertex(_)
                | GraphError::UnknownVertexName(_)
                | GraphError::UnknownReplica { .. }
                | GraphError::RoleNotFound(_)
        )
    }

    /// Errors of a single control call that the caller may retry.
    pub fn is_control_failure(&self) -> bool {
        matches!(
            self,
            GraphError::ControlTimeout { .. } | GraphError::Gateway { .. } | GraphError::NotDeployed(_)
        )
    }
}
