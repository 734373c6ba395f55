//! Task replicas: one parallel instance of a replica group.

use std::collections::VecDeque;
use std::sync::Arc;

use flow_core::{IntermediateDataSetId, JobVertexId, PartitionId};
use tracing::debug;

use crate::error::{GraphError, GraphResult};
use crate::execution::Execution;
use crate::gateway::InputGateDescriptor;
use crate::job_graph::DistributionPattern;
use crate::result::{ConsumerRef, IntermediateResult};

/// A replica's connection to one partition of an upstream result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionEdge {
    pub result_id: IntermediateDataSetId,
    pub partition_id: PartitionId,
    pub partition_number: usize,
    pub consumer_index: usize,
}

#[derive(Debug)]
pub struct ExecutionVertex {
    vertex_id: JobVertexId,
    subtask_index: usize,
    task_name: String,
    invokable: String,
    current: Arc<Execution>,
    prior: VecDeque<Arc<Execution>>,
    max_history: usize,
    /// Edges per input number.
    inputs: Vec<Vec<ExecutionEdge>>,
}

impl ExecutionVertex {
    pub fn new(
        vertex_id: JobVertexId,
        name: &str,
        subtask_index: usize,
        parallelism: usize,
        invokable: &str,
        max_history: usize,
    ) -> Self {
        let task_name = format!("{} ({}/{})", name, subtask_index + 1, parallelism);
        let current = Arc::new(Execution::new(vertex_id, &task_name, subtask_index, 0, invokable));
        Self {
            vertex_id,
            subtask_index,
            task_name,
            invokable: invokable.to_string(),
            current,
            prior: VecDeque::new(),
            max_history,
            inputs: Vec::new(),
        }
    }

    pub fn vertex_id(&self) -> JobVertexId {
        self.vertex_id
    }

    pub fn subtask_index(&self) -> usize {
        self.subtask_index
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn current_attempt(&self) -> &Arc<Execution> {
        &self.current
    }

    pub fn prior_attempts(&self) -> impl Iterator<Item = &Arc<Execution>> {
        self.prior.iter()
    }

    pub fn execution_state(&self) -> crate::state::ExecutionState {
        self.current.state()
    }

    /// Replace a terminated attempt with a fresh one. The old attempt is
    /// kept in a history bounded by `max_history`.
    pub fn reset_for_new_execution(&mut self) -> GraphResult<Arc<Execution>> {
        let state = self.current.state();
        if !state.is_terminal() {
            return Err(GraphError::IllegalState {
                attempt: self.current.attempt_id(),
                state,
                operation: "reset",
            });
        }

        let next = Arc::new(Execution::new(
            self.vertex_id,
            &self.task_name,
            self.subtask_index,
            self.current.attempt_number() + 1,
            &self.invokable,
        ));
        let old = std::mem::replace(&mut self.current, Arc::clone(&next));
        if self.max_history > 0 {
            if self.prior.len() == self.max_history {
                self.prior.pop_front();
            }
            self.prior.push_back(old);
        }
        debug!(task = %self.task_name, attempt = %next.attempt_id(), "replica reset for new execution");
        Ok(next)
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input_edges(&self, input_number: usize) -> &[ExecutionEdge] {
        self.inputs.get(input_number).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether input `input_number` has already been wired.
    pub fn is_connected(&self, input_number: usize) -> bool {
        !self.input_edges(input_number).is_empty()
    }

    /// Wire input `input_number` to the partitions of `source` this
    /// replica reads under `pattern`, and register the replica as a
    /// consumer on each of them.
    pub fn connect_source(
        &mut self,
        input_number: usize,
        source: &mut IntermediateResult,
        pattern: DistributionPattern,
        consumer_index: usize,
        parallelism: usize,
    ) {
        let partitions = match pattern {
            DistributionPattern::AllToAll => 0..source.num_partitions(),
            DistributionPattern::Pointwise => {
                pointwise_range(self.subtask_index, parallelism, source.num_partitions())
            }
        };

        if self.inputs.len() <= input_number {
            self.inputs.resize_with(input_number + 1, Vec::new);
        }
        for number in partitions {
            self.add_edge(input_number, source, number, consumer_index);
        }
    }

    /// Add a single edge, used when an upstream result gains a partition.
    pub(crate) fn add_edge(
        &mut self,
        input_number: usize,
        source: &mut IntermediateResult,
        partition_number: usize,
        consumer_index: usize,
    ) {
        let result_id = source.id();
        let consumer = ConsumerRef {
            vertex_id: self.vertex_id,
            subtask_index: self.subtask_index,
        };
        let Some(partition) = source.partition_mut(partition_number) else {
            return;
        };
        partition.add_consumer(consumer_index, consumer);
        let edge = ExecutionEdge {
            result_id,
            partition_id: partition.partition_id(),
            partition_number,
            consumer_index,
        };
        if self.inputs.len() <= input_number {
            self.inputs.resize_with(input_number + 1, Vec::new);
        }
        if !self.inputs[input_number].contains(&edge) {
            self.inputs[input_number].push(edge);
        }
    }

    pub fn input_gate_descriptors(&self) -> Vec<InputGateDescriptor> {
        self.inputs
            .iter()
            .filter_map(|edges| {
                let first = edges.first()?;
                Some(InputGateDescriptor {
                    result_id: first.result_id,
                    consumer_index: first.consumer_index,
                    partitions: edges.iter().map(|e| e.partition_id).collect(),
                })
            })
            .collect()
    }
}

/// Partitions read by `subtask` when `consumers` replicas read `producers`
/// partitions pointwise.
fn pointwise_range(subtask: usize, consumers: usize, producers: usize) -> std::ops::Range<usize> {
    if consumers == 0 || producers == 0 {
        return 0..0;
    }
    if producers >= consumers {
        let start = subtask * producers / consumers;
        let end = (subtask + 1) * producers / consumers;
        start..end
    } else {
        let source = subtask * producers / consumers;
        source..source + 1
    }
}
