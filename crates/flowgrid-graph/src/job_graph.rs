//! Static job graph: operator templates and the edges between them.
//!
//! A `JobVertex` is the immutable description of one logical operator. It
//! is built once, either from `flowgrid.toml` or programmatically when an
//! operator is spliced into a running job, and then handed to the
//! execution graph, which never mutates it.

use std::collections::{BTreeMap, HashMap};

use flow_core::config::{JobConfig, PatternConfig};
use flow_core::{IntermediateDataSetId, JobId, JobVertexId};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};

/// How producer partitions map onto consumer replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionPattern {
    /// Every consumer replica reads every producer partition.
    AllToAll,
    /// Each consumer replica reads a contiguous slice of partitions.
    Pointwise,
}

impl From<PatternConfig> for DistributionPattern {
    fn from(p: PatternConfig) -> Self {
        match p {
            PatternConfig::AllToAll => DistributionPattern::AllToAll,
            PatternConfig::Pointwise => DistributionPattern::Pointwise,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPartitionType {
    Pipelined,
    Blocking,
}

/// A dataset declared as output of a job vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateDataSet {
    pub id: IntermediateDataSetId,
    pub producer: JobVertexId,
    pub result_type: ResultPartitionType,
}

/// An input edge of a job vertex, referencing its source dataset by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEdge {
    pub source_id: IntermediateDataSetId,
    pub pattern: DistributionPattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobVertex {
    pub id: JobVertexId,
    pub name: String,
    /// Declared parallelism; `0` means "use the graph default".
    pub parallelism: usize,
    pub max_parallelism: Option<usize>,
    /// Name the worker resolves to an operator implementation.
    pub invokable: String,
    pub configuration: BTreeMap<String, String>,
    /// Explicit role tags ("source", "map", …) used by role lookup.
    pub roles: Vec<String>,
    pub inputs: Vec<JobEdge>,
    pub produced: Vec<IntermediateDataSet>,
}

impl JobVertex {
    pub fn new(name: &str) -> Self {
        Self::with_id(name, JobVertexId::generate())
    }

    pub fn with_id(name: &str, id: JobVertexId) -> Self {
        Self {
            id,
            name: name.to_string(),
            parallelism: 0,
            max_parallelism: None,
            invokable: String::new(),
            configuration: BTreeMap::new(),
            roles: Vec::new(),
            inputs: Vec::new(),
            produced: Vec::new(),
        }
    }

    pub fn set_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn set_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = Some(max);
        self
    }

    pub fn set_invokable(mut self, invokable: &str) -> Self {
        self.invokable = invokable.to_string();
        self
    }

    pub fn add_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Declare a new produced dataset and return its id.
    pub fn create_and_add_result_data_set(
        &mut self,
        result_type: ResultPartitionType,
    ) -> IntermediateDataSetId {
        self.add_result_data_set(IntermediateDataSetId::generate(), result_type)
    }

    /// Declare a produced dataset with a caller-chosen id.
    pub fn add_result_data_set(
        &mut self,
        id: IntermediateDataSetId,
        result_type: ResultPartitionType,
    ) -> IntermediateDataSetId {
        self.produced.push(IntermediateDataSet {
            id,
            producer: self.id,
            result_type,
        });
        id
    }

    pub fn connect_data_set_as_input(
        &mut self,
        data_set: &IntermediateDataSet,
        pattern: DistributionPattern,
    ) {
        self.inputs.push(JobEdge {
            source_id: data_set.id,
            pattern,
        });
    }

    pub fn num_produced(&self) -> usize {
        self.produced.len()
    }
}

/// The static logical plan submitted for a job, in topological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGraph {
    pub job_id: JobId,
    pub name: String,
    pub vertices: Vec<JobVertex>,
}

impl JobGraph {
    pub fn new(name: &str) -> Self {
        Self {
            job_id: JobId::generate(),
            name: name.to_string(),
            vertices: Vec::new(),
        }
    }

    pub fn add_vertex(&mut self, vertex: JobVertex) {
        self.vertices.push(vertex);
    }

    /// Build the job graph described in `flowgrid.toml`.
    ///
    /// Each vertex that feeds at least one other vertex gets a single
    /// pipelined dataset shared by all of its consumers.
    pub fn from_config(config: &JobConfig) -> GraphResult<Self> {
        let mut graph = JobGraph::new(&config.name);
        let mut by_name: HashMap<&str, usize> = HashMap::new();

        for vc in &config.vertices {
            let mut vertex = JobVertex::new(&vc.name)
                .set_parallelism(vc.parallelism as usize)
                .set_invokable(&vc.invokable);
            vertex.max_parallelism = vc.max_parallelism.map(|m| m as usize);
            vertex.roles = vc.roles.clone();

            for input in &vc.inputs {
                let upstream_idx = *by_name
                    .get(input.from.as_str())
                    .ok_or_else(|| GraphError::UnknownVertexName(input.from.clone()))?;
                let upstream = &mut graph.vertices[upstream_idx];
                if upstream.produced.is_empty() {
                    upstream.create_and_add_result_data_set(ResultPartitionType::Pipelined);
                }
                let data_set = upstream.produced[0].clone();
                vertex.connect_data_set_as_input(&data_set, input.pattern.into());
            }

            by_name.insert(vc.name.as_str(), graph.vertices.len());
            graph.add_vertex(vertex);
        }

        Ok(graph)
    }
}
