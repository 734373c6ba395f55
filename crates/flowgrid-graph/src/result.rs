//! Intermediate results and their partitions.
//!
//! An `IntermediateResult` is the runtime output of one replica group. It
//! holds exactly one partition per producer replica, and for each
//! partition the replicas of every consumer group reading it, indexed by
//! consumer index.

use flow_core::{IntermediateDataSetId, JobVertexId, PartitionId};
use serde::Serialize;

use crate::error::{GraphError, GraphResult};
use crate::job_graph::ResultPartitionType;

/// A consumer replica reading a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerRef {
    pub vertex_id: JobVertexId,
    pub subtask_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntermediateResultPartition {
    partition_id: PartitionId,
    partition_number: usize,
    /// Consumer replicas per consumer index.
    consumers: Vec<Vec<ConsumerRef>>,
}

impl IntermediateResultPartition {
    fn new(partition_number: usize, num_consumers: usize) -> Self {
        Self {
            partition_id: PartitionId::generate(),
            partition_number,
            consumers: vec![Vec::new(); num_consumers],
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn partition_number(&self) -> usize {
        self.partition_number
    }

    pub fn consumers(&self) -> &[Vec<ConsumerRef>] {
        &self.consumers
    }

    fn add_consumer_group(&mut self) -> usize {
        self.consumers.push(Vec::new());
        self.consumers.len() - 1
    }

    pub(crate) fn add_consumer(&mut self, consumer_index: usize, consumer: ConsumerRef) {
        if let Some(group) = self.consumers.get_mut(consumer_index)
            && !group.contains(&consumer)
        {
            group.push(consumer);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntermediateResult {
    id: IntermediateDataSetId,
    producer: JobVertexId,
    result_type: ResultPartitionType,
    partitions: Vec<IntermediateResultPartition>,
    /// Consumer group vertex per consumer index.
    consumer_vertices: Vec<JobVertexId>,
}

impl IntermediateResult {
    pub fn new(
        id: IntermediateDataSetId,
        producer: JobVertexId,
        num_partitions: usize,
        result_type: ResultPartitionType,
    ) -> Self {
        Self {
            id,
            producer,
            result_type,
            partitions: (0..num_partitions)
                .map(|n| IntermediateResultPartition::new(n, 0))
                .collect(),
            consumer_vertices: Vec::new(),
        }
    }

    pub fn id(&self) -> IntermediateDataSetId {
        self.id
    }

    pub fn producer(&self) -> JobVertexId {
        self.producer
    }

    pub fn result_type(&self) -> ResultPartitionType {
        self.result_type
    }

    pub fn partitions(&self) -> &[IntermediateResultPartition] {
        &self.partitions
    }

    pub fn partition(&self, number: usize) -> Option<&IntermediateResultPartition> {
        self.partitions.get(number)
    }

    pub(crate) fn partition_mut(&mut self, number: usize) -> Option<&mut IntermediateResultPartition> {
        self.partitions.get_mut(number)
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn num_consumers(&self) -> usize {
        self.consumer_vertices.len()
    }

    pub fn consumer_vertices(&self) -> &[JobVertexId] {
        &self.consumer_vertices
    }

    pub fn consumer_index_of(&self, vertex: JobVertexId) -> Option<usize> {
        self.consumer_vertices.iter().position(|v| *v == vertex)
    }

    /// Register a new logical consumer slot, as done while the graph is
    /// being built. Every call allocates a fresh consumer index.
    pub fn register_consumer(&mut self, consumer: JobVertexId) -> GraphResult<usize> {
        let index = self.consumer_vertices.len();
        for partition in &mut self.partitions {
            let assigned = partition.add_consumer_group();
            if assigned != index {
                return Err(GraphError::ConsumerIndexMismatch {
                    result: self.id,
                    expected: index,
                    found: assigned,
                });
            }
        }
        self.consumer_vertices.push(consumer);
        Ok(index)
    }

    /// Register against a live result. A group that already consumes this
    /// result keeps its index; a new group is appended after every
    /// existing consumer, so no index held by a running consumer moves.
    pub fn register_consumer_runtime(&mut self, consumer: JobVertexId) -> GraphResult<usize> {
        match self.consumer_index_of(consumer) {
            Some(index) => Ok(index),
            None => self.register_consumer(consumer),
        }
    }

    /// Check that every partition carries a slot for every consumer index.
    pub(crate) fn verify_consumer_slots(&self) -> GraphResult<()> {
        let expected = self.num_consumers();
        match self.partitions.iter().find(|p| p.consumers.len() != expected) {
            Some(p) => Err(GraphError::ConsumerIndexMismatch {
                result: self.id,
                expected,
                found: p.consumers.len(),
            }),
            None => Ok(()),
        }
    }

    /// Grow to `new_parallelism` partitions; existing partitions keep their
    /// ids and numbers.
    pub fn increase_parallelism(&mut self, new_parallelism: usize) -> GraphResult<()> {
        if new_parallelism < self.partitions.len() {
            return Err(GraphError::PartitionMismatch {
                result: self.id,
                partitions: self.partitions.len(),
                parallelism: new_parallelism,
            });
        }
        let num_consumers = self.num_consumers();
        for n in self.partitions.len()..new_parallelism {
            self.partitions
                .push(IntermediateResultPartition::new(n, num_consumers));
        }
        Ok(())
    }

    /// Fail unless the partition count equals the producer's parallelism.
    pub fn check_partitions(&self, parallelism: usize) -> GraphResult<()> {
        if self.partitions.len() != parallelism {
            return Err(GraphError::PartitionMismatch {
                result: self.id,
                partitions: self.partitions.len(),
                parallelism,
            });
        }
        Ok(())
    }
}
