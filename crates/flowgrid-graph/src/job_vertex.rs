//! Replica groups: the runtime holder of all replicas of one operator.
//!
//! Besides construction and lookups, this is where the graph is mutated at
//! runtime: `grow_parallelism` appends one replica and one partition, and
//! `connect_to_predecessors` wires replicas to their upstream results in
//! either build or runtime mode. Callers hold the graph's mutation lock
//! around both (they take `&mut` to the registry owned by `GraphState`).

use std::collections::HashMap;
use std::sync::Arc;

use flow_core::{IntermediateDataSetId, JobVertexId};
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};
use crate::execution::Execution;
use crate::job_graph::{DistributionPattern, JobVertex};
use crate::result::IntermediateResult;
use crate::slot::{Slot, SlotProvider, SlotRequest};
use crate::state::ExecutionState;
use crate::vertex::ExecutionVertex;

pub const UPPER_BOUND_MAX_PARALLELISM: usize = 1 << 15;
const DEFAULT_LOWER_BOUND_MAX_PARALLELISM: usize = 1 << 7;

/// `next_power_of_two(1.5 * parallelism)`, clamped to `128..=32768`.
pub fn compute_default_max_parallelism(parallelism: usize) -> usize {
    (parallelism + parallelism / 2)
        .next_power_of_two()
        .clamp(DEFAULT_LOWER_BOUND_MAX_PARALLELISM, UPPER_BOUND_MAX_PARALLELISM)
}

/// How `connect_to_predecessors` registers with upstream results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Graph construction: every call registers a new consumer slot.
    Build,
    /// Live graph: reuse this group's existing consumer index (or append a
    /// new one) and wire only replicas that are not yet connected.
    Runtime,
}

pub type ResultRegistry = HashMap<IntermediateDataSetId, IntermediateResult>;

#[derive(Debug)]
pub struct ExecutionJobVertex {
    job_vertex: JobVertex,
    parallelism: usize,
    max_parallelism: usize,
    max_parallelism_configured: bool,
    /// Append-only; index == replica ordinal.
    replicas: Vec<ExecutionVertex>,
    produced: Vec<IntermediateDataSetId>,
    /// Consumed results, per input number.
    inputs: Vec<IntermediateDataSetId>,
    max_history: usize,
}

impl ExecutionJobVertex {
    /// Instantiate a replica group and the results it produces. The
    /// results are returned separately for the caller to register.
    pub fn new(
        job_vertex: JobVertex,
        default_parallelism: usize,
        max_history: usize,
    ) -> GraphResult<(Self, Vec<IntermediateResult>)> {
        let parallelism = if job_vertex.parallelism > 0 {
            job_vertex.parallelism
        } else {
            default_parallelism
        };
        if parallelism == 0 {
            return Err(GraphError::InvalidParallelism(job_vertex.name.clone()));
        }

        let (max_parallelism, configured) = match job_vertex.max_parallelism {
            Some(max) if max == 0 || max > UPPER_BOUND_MAX_PARALLELISM => {
                return Err(GraphError::InvalidMaxParallelism(max));
            }
            Some(max) => (max, true),
            None => (compute_default_max_parallelism(parallelism), false),
        };
        if parallelism > max_parallelism {
            return Err(GraphError::MaxParallelismExceeded {
                vertex: job_vertex.name.clone(),
                max: max_parallelism,
            });
        }

        let results: Vec<IntermediateResult> = job_vertex
            .produced
            .iter()
            .map(|ds| IntermediateResult::new(ds.id, job_vertex.id, parallelism, ds.result_type))
            .collect();

        let replicas = (0..parallelism)
            .map(|i| {
                ExecutionVertex::new(
                    job_vertex.id,
                    &job_vertex.name,
                    i,
                    parallelism,
                    &job_vertex.invokable,
                    max_history,
                )
            })
            .collect();

        for result in &results {
            result.check_partitions(parallelism)?;
        }

        let group = Self {
            produced: results.iter().map(IntermediateResult::id).collect(),
            inputs: Vec::with_capacity(job_vertex.inputs.len()),
            job_vertex,
            parallelism,
            max_parallelism,
            max_parallelism_configured: configured,
            replicas,
            max_history,
        };
        Ok((group, results))
    }

    pub fn id(&self) -> JobVertexId {
        self.job_vertex.id
    }

    pub fn name(&self) -> &str {
        &self.job_vertex.name
    }

    pub fn job_vertex(&self) -> &JobVertex {
        &self.job_vertex
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    pub fn is_max_parallelism_configured(&self) -> bool {
        self.max_parallelism_configured
    }

    pub fn replicas(&self) -> &[ExecutionVertex] {
        &self.replicas
    }

    pub fn replica(&self, ordinal: usize) -> Option<&ExecutionVertex> {
        self.replicas.get(ordinal)
    }

    pub(crate) fn replicas_mut(&mut self) -> &mut [ExecutionVertex] {
        &mut self.replicas
    }

    pub fn produced_data_sets(&self) -> &[IntermediateDataSetId] {
        &self.produced
    }

    pub fn inputs(&self) -> &[IntermediateDataSetId] {
        &self.inputs
    }

    pub fn current_attempts(&self) -> Vec<Arc<Execution>> {
        self.replicas
            .iter()
            .map(|r| Arc::clone(r.current_attempt()))
            .collect()
    }

    pub fn aggregate_state(&self) -> ExecutionState {
        ExecutionState::aggregate(
            self.replicas.iter().map(ExecutionVertex::execution_state),
            self.parallelism,
        )
    }

    pub fn debug_string(&self) -> String {
        format!(
            "ExecutionJobVertex({} | {}){{parallelism={}, maxParallelism={}, maxParallelismConfigured={}}}",
            self.job_vertex.name,
            self.job_vertex.id,
            self.parallelism,
            self.max_parallelism,
            self.max_parallelism_configured
        )
    }

    // ── Runtime mutation ────────────────────────────────────────────

    /// Wire every input edge to its upstream result.
    ///
    /// All upstream results are resolved before anything is touched, so a
    /// missing predecessor (the registry must already hold every upstream
    /// result, i.e. vertices are connected in topological order) leaves
    /// both the group and the registry unchanged.
    pub fn connect_to_predecessors(
        &mut self,
        results: &mut ResultRegistry,
        mode: ConnectMode,
    ) -> GraphResult<()> {
        let edges = self.job_vertex.inputs.clone();

        for (num, edge) in edges.iter().enumerate() {
            let result = results
                .get(&edge.source_id)
                .ok_or(GraphError::MissingPredecessor {
                    vertex: self.id(),
                    input: num,
                    result: edge.source_id,
                })?;
            result.verify_consumer_slots()?;
        }

        debug!(
            vertex = %self.id(),
            name = %self.name(),
            predecessors = edges.len(),
            ?mode,
            "connecting to predecessors"
        );

        for (num, edge) in edges.iter().enumerate() {
            let Some(result) = results.get_mut(&edge.source_id) else {
                return Err(GraphError::MissingPredecessor {
                    vertex: self.id(),
                    input: num,
                    result: edge.source_id,
                });
            };

            let consumer_index = match mode {
                ConnectMode::Build => result.register_consumer(self.job_vertex.id)?,
                ConnectMode::Runtime => result.register_consumer_runtime(self.job_vertex.id)?,
            };
            if self.inputs.len() <= num {
                self.inputs.push(edge.source_id);
            }

            let parallelism = self.parallelism;
            for replica in &mut self.replicas {
                if mode == ConnectMode::Runtime && replica.is_connected(num) {
                    continue;
                }
                replica.connect_source(num, result, edge.pattern, consumer_index, parallelism);
            }

            debug!(
                vertex = %self.id(),
                input = num,
                result = %edge.source_id,
                consumer_index,
                "input connected"
            );
        }
        Ok(())
    }

    /// Add exactly one replica.
    ///
    /// The sole produced result grows by one partition and the new replica
    /// is wired to its inputs in runtime mode. Returns the new ordinal.
    /// Every precondition is checked before the first change.
    pub fn grow_parallelism(&mut self, results: &mut ResultRegistry) -> GraphResult<usize> {
        if self.produced.len() != 1 {
            return Err(GraphError::UnexpectedShape {
                vertex: self.name().to_string(),
                what: "produced results",
                expected: 1,
                found: self.produced.len(),
            });
        }
        let new_parallelism = self.parallelism + 1;
        if new_parallelism > self.max_parallelism {
            return Err(GraphError::MaxParallelismExceeded {
                vertex: self.name().to_string(),
                max: self.max_parallelism,
            });
        }

        let result_id = self.produced[0];
        results
            .get(&result_id)
            .ok_or(GraphError::UnknownResult(result_id))?
            .check_partitions(self.parallelism)?;
        for (num, edge) in self.job_vertex.inputs.iter().enumerate() {
            if !results.contains_key(&edge.source_id) {
                return Err(GraphError::MissingPredecessor {
                    vertex: self.id(),
                    input: num,
                    result: edge.source_id,
                });
            }
        }

        debug!(vertex = %self.id(), name = %self.name(), to = new_parallelism, "increasing parallelism");

        let produced = results
            .get_mut(&result_id)
            .ok_or(GraphError::UnknownResult(result_id))?;
        produced.increase_parallelism(new_parallelism)?;

        let ordinal = self.parallelism;
        self.parallelism = new_parallelism;
        self.replicas.push(ExecutionVertex::new(
            self.job_vertex.id,
            &self.job_vertex.name,
            ordinal,
            new_parallelism,
            &self.job_vertex.invokable,
            self.max_history,
        ));

        self.connect_to_predecessors(results, ConnectMode::Runtime)?;

        results
            .get(&result_id)
            .ok_or(GraphError::UnknownResult(result_id))?
            .check_partitions(self.parallelism)?;

        debug!(
            vertex = %self.id(),
            ordinal,
            attempt = %self.replicas[ordinal].current_attempt().attempt_id(),
            "replica added"
        );
        Ok(ordinal)
    }

    /// Wire every replica reading `result` all-to-all to its newly added
    /// partition. Pointwise inputs keep their existing assignment.
    pub(crate) fn connect_new_partition(
        &mut self,
        result: &mut IntermediateResult,
        partition_number: usize,
    ) {
        let Some(consumer_index) = result.consumer_index_of(self.id()) else {
            return;
        };
        let inputs: Vec<(usize, DistributionPattern)> = self
            .job_vertex
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, e)| e.source_id == result.id())
            .map(|(num, e)| (num, e.pattern))
            .collect();

        for (num, pattern) in inputs {
            match pattern {
                DistributionPattern::AllToAll => {
                    for replica in &mut self.replicas {
                        replica.add_edge(num, result, partition_number, consumer_index);
                    }
                }
                DistributionPattern::Pointwise => {
                    debug!(
                        vertex = %self.id(),
                        input = num,
                        partition = partition_number,
                        "pointwise consumer left on its existing partitions"
                    );
                }
            }
        }
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Acquire one slot per listed replica, all or nothing: if any
    /// allocation fails, every slot acquired so far in this batch is
    /// released before the error is returned.
    pub fn allocate_resources_for_all(
        &self,
        provider: &dyn SlotProvider,
        ordinals: &[usize],
        preferred_locations: &[String],
    ) -> GraphResult<Vec<(Arc<Execution>, Slot)>> {
        let mut attempts = Vec::with_capacity(ordinals.len());
        for &ordinal in ordinals {
            let replica = self.replica(ordinal).ok_or_else(|| GraphError::UnknownReplica {
                vertex: self.name().to_string(),
                ordinal,
            })?;
            attempts.push(Arc::clone(replica.current_attempt()));
        }

        let mut acquired: Vec<(Arc<Execution>, Slot)> = Vec::with_capacity(attempts.len());
        for exec in attempts {
            let request = SlotRequest {
                attempt_id: exec.attempt_id(),
                vertex_id: self.id(),
                task_name: exec.task_name().to_string(),
                subtask_index: exec.subtask_index(),
                preferred_locations: preferred_locations.to_vec(),
            };
            match provider.allocate_slot(&request) {
                Ok(slot) => acquired.push((exec, slot)),
                Err(e) => {
                    warn!(
                        vertex = %self.name(),
                        subtask = exec.subtask_index(),
                        released = acquired.len(),
                        error = %e,
                        "slot allocation failed, releasing batch"
                    );
                    for (_, slot) in &acquired {
                        provider.release_slot(slot);
                    }
                    return Err(e);
                }
            }
        }
        Ok(acquired)
    }

    /// Mark every replica's current attempt failed.
    pub fn fail(&self) {
        for replica in &self.replicas {
            if !replica.execution_state().is_terminal() {
                replica.current_attempt().mark(ExecutionState::Failed);
            }
        }
    }

    /// Give every replica a fresh attempt. Nothing changes unless every
    /// current attempt is terminal.
    pub fn reset_for_new_execution(&mut self) -> GraphResult<Vec<Arc<Execution>>> {
        if let Some(live) = self
            .replicas
            .iter()
            .map(ExecutionVertex::current_attempt)
            .find(|exec| !exec.state().is_terminal())
        {
            return Err(GraphError::IllegalState {
                attempt: live.attempt_id(),
                state: live.state(),
                operation: "reset",
            });
        }
        self.replicas
            .iter_mut()
            .map(ExecutionVertex::reset_for_new_execution)
            .collect()
    }
}
