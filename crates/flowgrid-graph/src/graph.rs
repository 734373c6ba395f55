//! The execution graph of one job and its registries.
//!
//! `ExecutionGraph` owns the vertex and result registries behind a single
//! mutation lock (`GraphState`). Every structural change, whether it is
//! attaching the initial job graph, splicing in a new operator or growing
//! a group by one replica, happens while that lock is held and is checked
//! in full before the first registry write.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flow_core::{BlobSet, ExecutionAttemptId, IntermediateDataSetId, JobId, JobVertexId};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{GraphError, GraphResult};
use crate::execution::{Execution, epoch_millis};
use crate::gateway::TaskDeploymentDescriptor;
use crate::job_graph::{JobGraph, JobVertex};
use crate::job_vertex::{ConnectMode, ExecutionJobVertex, ResultRegistry};
use crate::result::IntermediateResult;
use crate::slot::SlotProvider;
use crate::state::ExecutionState;

// ── Job status ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Running,
    Failing,
    Failed,
    Canceling,
    Canceled,
    Finished,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Created => "CREATED",
            JobStatus::Running => "RUNNING",
            JobStatus::Failing => "FAILING",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceling => "CANCELING",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Finished => "FINISHED",
        };
        f.write_str(label)
    }
}

/// Why the job failed globally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub message: String,
    /// Unix epoch millis.
    pub at: u64,
}

// ── Registries ──────────────────────────────────────────────────────

/// Everything guarded by the job's mutation lock.
#[derive(Debug, Default)]
pub struct GraphState {
    tasks: HashMap<JobVertexId, ExecutionJobVertex>,
    results: ResultRegistry,
    creation_order: Vec<JobVertexId>,
    registered: HashMap<ExecutionAttemptId, Arc<Execution>>,
}

impl GraphState {
    pub fn task(&self, id: JobVertexId) -> Option<&ExecutionJobVertex> {
        self.tasks.get(&id)
    }

    /// Replica groups in creation order.
    pub fn tasks_in_order(&self) -> impl Iterator<Item = &ExecutionJobVertex> {
        self.creation_order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn result(&self, id: IntermediateDataSetId) -> Option<&IntermediateResult> {
        self.results.get(&id)
    }

    pub fn num_vertices(&self) -> usize {
        self.tasks.len()
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    pub fn registered_attempt(&self, id: ExecutionAttemptId) -> Option<&Arc<Execution>> {
        self.registered.get(&id)
    }

    /// Registered attempts, sorted by attempt id.
    pub fn registered_attempts(&self) -> Vec<&Arc<Execution>> {
        let mut attempts: Vec<_> = self.registered.values().collect();
        attempts.sort_by_key(|e| e.attempt_id());
        attempts
    }

    /// Locate a group by role; the last match in creation order wins.
    ///
    /// Vertices tagged with `role` are matched exactly. Only when no vertex
    /// carries the tag does the lookup fall back to a case-insensitive
    /// substring match on the vertex name.
    pub fn find_by_role(&self, role: &str) -> Option<JobVertexId> {
        let tagged = self
            .tasks_in_order()
            .filter(|t| t.job_vertex().has_role(role))
            .last();
        if let Some(task) = tagged {
            return Some(task.id());
        }
        let needle = role.to_lowercase();
        self.tasks_in_order()
            .filter(|t| t.name().to_lowercase().contains(&needle))
            .last()
            .map(ExecutionJobVertex::id)
    }

    fn register_attempt(&mut self, exec: &Arc<Execution>) {
        self.registered.insert(exec.attempt_id(), Arc::clone(exec));
    }

    fn register_group_attempts(&mut self, vertex: JobVertexId) {
        let attempts = self
            .tasks
            .get(&vertex)
            .map(ExecutionJobVertex::current_attempts)
            .unwrap_or_default();
        for exec in &attempts {
            self.register_attempt(exec);
        }
    }

    /// Check a template against the registries without touching them.
    fn check_collisions(&self, vertex: &JobVertex) -> GraphResult<()> {
        if self.tasks.contains_key(&vertex.id) {
            return Err(GraphError::DuplicateVertex(vertex.id));
        }
        let mut seen = BTreeSet::new();
        for ds in &vertex.produced {
            if self.results.contains_key(&ds.id) || !seen.insert(ds.id) {
                return Err(GraphError::DuplicateResult(ds.id));
            }
        }
        Ok(())
    }

    /// Instantiate, connect and register one template. Nothing is written
    /// unless every check passes.
    fn add_vertex(
        &mut self,
        vertex: JobVertex,
        mode: ConnectMode,
        default_parallelism: usize,
        max_history: usize,
    ) -> GraphResult<JobVertexId> {
        self.check_collisions(&vertex)?;
        for (num, edge) in vertex.inputs.iter().enumerate() {
            if !self.results.contains_key(&edge.source_id) {
                return Err(GraphError::MissingPredecessor {
                    vertex: vertex.id,
                    input: num,
                    result: edge.source_id,
                });
            }
        }

        let (mut group, produced) = ExecutionJobVertex::new(vertex, default_parallelism, max_history)?;
        group.connect_to_predecessors(&mut self.results, mode)?;

        let id = group.id();
        for result in produced {
            self.results.entry(result.id()).or_insert(result);
        }
        self.tasks.entry(id).or_insert(group);
        self.creation_order.push(id);
        self.register_group_attempts(id);
        Ok(id)
    }

    /// Registry contents reduced to comparable form.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            vertices: self
                .tasks_in_order()
                .map(|t| (t.id(), t.parallelism()))
                .collect(),
            results: self
                .results
                .values()
                .map(|r| (r.id(), (r.num_partitions(), r.consumer_vertices().to_vec())))
                .collect(),
            attempts: self.registered.keys().copied().collect(),
        }
    }
}

/// Comparable view of the registries: vertices with their parallelism,
/// results with partition count and consumers, registered attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub vertices: Vec<(JobVertexId, usize)>,
    pub results: BTreeMap<IntermediateDataSetId, (usize, Vec<JobVertexId>)>,
    pub attempts: BTreeSet<ExecutionAttemptId>,
}

/// A scheduled attempt and the descriptor to deploy it with.
#[derive(Debug)]
pub struct PendingDeployment {
    pub execution: Arc<Execution>,
    pub descriptor: TaskDeploymentDescriptor,
}

// ── Execution graph ─────────────────────────────────────────────────

pub struct ExecutionGraph {
    job_id: JobId,
    job_name: String,
    state: Mutex<GraphState>,
    status: Mutex<JobStatus>,
    failure: Mutex<Option<FailureCause>>,
    slot_provider: Arc<dyn SlotProvider>,
    default_parallelism: usize,
    max_history: usize,
    /// Bumped on every structural change.
    global_mod_version: AtomicU64,
}

impl fmt::Debug for ExecutionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGraph")
            .field("job_id", &self.job_id)
            .field("job_name", &self.job_name)
            .field("status", &self.status())
            .finish()
    }
}

impl ExecutionGraph {
    pub fn new(
        job_id: JobId,
        job_name: &str,
        slot_provider: Arc<dyn SlotProvider>,
        max_history: usize,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.to_string(),
            state: Mutex::new(GraphState::default()),
            status: Mutex::new(JobStatus::Created),
            failure: Mutex::new(None),
            slot_provider,
            default_parallelism: 1,
            max_history,
            global_mod_version: AtomicU64::new(0),
        }
    }

    /// Build the execution graph for `job_graph`, wiring vertices in the
    /// order they were declared.
    pub fn from_job_graph(
        job_graph: &JobGraph,
        slot_provider: Arc<dyn SlotProvider>,
        max_history: usize,
    ) -> GraphResult<Self> {
        let graph = Self::new(job_graph.job_id, &job_graph.name, slot_provider, max_history);
        graph.attach_job_graph(job_graph)?;
        Ok(graph)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn slot_provider(&self) -> &Arc<dyn SlotProvider> {
        &self.slot_provider
    }

    /// Take the mutation lock.
    pub fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: JobStatus) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != status {
            info!(job = %self.job_id, from = %*current, to = %status, "job status changed");
            *current = status;
        }
    }

    pub fn failure_cause(&self) -> Option<FailureCause> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn global_mod_version(&self) -> u64 {
        self.global_mod_version.load(Ordering::Acquire)
    }

    // ── Structure ───────────────────────────────────────────────────

    pub fn attach_job_graph(&self, job_graph: &JobGraph) -> GraphResult<()> {
        let mut state = self.lock();
        debug!(
            job = %self.job_id,
            vertices = job_graph.vertices.len(),
            existing = state.num_vertices(),
            "attaching job graph"
        );
        for vertex in &job_graph.vertices {
            state.add_vertex(
                vertex.clone(),
                ConnectMode::Build,
                self.default_parallelism,
                self.max_history,
            )?;
        }
        self.global_mod_version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Add a new operator to the live graph.
    ///
    /// The vertex id and every produced result id must be new; a collision
    /// aborts before any registry changes.
    pub fn splice_vertex(&self, vertex: JobVertex) -> GraphResult<JobVertexId> {
        let mut state = self.lock();
        let name = vertex.name.clone();
        let id = state.add_vertex(
            vertex,
            ConnectMode::Runtime,
            self.default_parallelism,
            self.max_history,
        )?;
        self.global_mod_version.fetch_add(1, Ordering::AcqRel);
        info!(job = %self.job_id, vertex = %id, %name, "operator spliced into running job");
        Ok(id)
    }

    /// Add one replica to `vertex` and wire all-to-all consumers of its
    /// produced result to the new partition. Returns the new attempt.
    pub fn grow_parallelism(&self, vertex: JobVertexId) -> GraphResult<Arc<Execution>> {
        let mut guard = self.lock();
        let GraphState {
            tasks,
            results,
            registered,
            ..
        } = &mut *guard;

        let group = tasks.get_mut(&vertex).ok_or(GraphError::UnknownVertex(vertex))?;
        let ordinal = group.grow_parallelism(results)?;
        let exec = group
            .replica(ordinal)
            .map(|r| Arc::clone(r.current_attempt()))
            .ok_or_else(|| GraphError::UnknownReplica {
                vertex: group.name().to_string(),
                ordinal,
            })?;
        let produced = group.produced_data_sets()[0];

        let result = results
            .get_mut(&produced)
            .ok_or(GraphError::UnknownResult(produced))?;
        for consumer in result.consumer_vertices().to_vec() {
            if let Some(downstream) = tasks.get_mut(&consumer) {
                downstream.connect_new_partition(result, ordinal);
            }
        }

        registered.insert(exec.attempt_id(), Arc::clone(&exec));
        self.global_mod_version.fetch_add(1, Ordering::AcqRel);
        info!(job = %self.job_id, %vertex, ordinal, attempt = %exec.attempt_id(), "parallelism increased");
        Ok(exec)
    }

    pub fn find_by_role(&self, role: &str) -> GraphResult<JobVertexId> {
        self.lock()
            .find_by_role(role)
            .ok_or_else(|| GraphError::RoleNotFound(role.to_string()))
    }

    /// Current attempts of a group, in ordinal order.
    pub fn current_attempts(&self, vertex: JobVertexId) -> GraphResult<Vec<Arc<Execution>>> {
        self.lock()
            .task(vertex)
            .map(ExecutionJobVertex::current_attempts)
            .ok_or(GraphError::UnknownVertex(vertex))
    }

    /// Locations where the given attempts run.
    pub fn locations_of(&self, attempts: &[ExecutionAttemptId]) -> Vec<String> {
        let state = self.lock();
        let mut locations: Vec<String> = attempts
            .iter()
            .filter_map(|id| state.registered_attempt(*id))
            .filter_map(|e| e.assigned_location())
            .collect();
        locations.dedup();
        locations
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Allocate slots for the listed replicas and build their deployment
    /// descriptors. All or nothing: on failure no slot stays allocated.
    pub fn schedule_replicas(
        &self,
        vertex: JobVertexId,
        ordinals: &[usize],
        preferred_locations: &[String],
        blob_keys: &BlobSet,
    ) -> GraphResult<Vec<PendingDeployment>> {
        let state = self.lock();
        let group = state.task(vertex).ok_or(GraphError::UnknownVertex(vertex))?;

        for &ordinal in ordinals {
            let replica = group.replica(ordinal).ok_or_else(|| GraphError::UnknownReplica {
                vertex: group.name().to_string(),
                ordinal,
            })?;
            let exec = replica.current_attempt();
            if exec.state() != ExecutionState::Created {
                return Err(GraphError::IllegalState {
                    attempt: exec.attempt_id(),
                    state: exec.state(),
                    operation: "schedule",
                });
            }
        }

        let allocated =
            group.allocate_resources_for_all(self.slot_provider.as_ref(), ordinals, preferred_locations)?;

        let mut pending = Vec::with_capacity(allocated.len());
        for (exec, slot) in allocated {
            let subtask = exec.subtask_index();
            let produced_partitions = group
                .produced_data_sets()
                .iter()
                .filter_map(|id| {
                    let partition = state.result(*id)?.partition(subtask)?;
                    Some((*id, partition.partition_id()))
                })
                .collect();
            let input_gates = group
                .replica(subtask)
                .map(|r| r.input_gate_descriptors())
                .unwrap_or_default();

            exec.assign_slot(slot)?;
            pending.push(PendingDeployment {
                descriptor: TaskDeploymentDescriptor {
                    job_id: self.job_id,
                    vertex_id: vertex,
                    attempt_id: exec.attempt_id(),
                    task_name: exec.task_name().to_string(),
                    subtask_index: subtask,
                    parallelism: group.parallelism(),
                    invokable: exec.invokable().to_string(),
                    produced_partitions,
                    input_gates,
                    blob_keys: blob_keys.clone(),
                },
                execution: exec,
            });
        }
        debug!(job = %self.job_id, %vertex, scheduled = pending.len(), "replicas scheduled");
        Ok(pending)
    }

    /// Deploy scheduled attempts concurrently. Every deployment runs to
    /// completion; a failed attempt gives its slot back. Returns the
    /// first error.
    pub async fn deploy(&self, pending: Vec<PendingDeployment>, timeout: Duration) -> GraphResult<()> {
        let mut set = JoinSet::new();
        for PendingDeployment { execution, descriptor } in pending {
            set.spawn(async move {
                let outcome = execution.deploy(descriptor, timeout).await;
                (execution, outcome)
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let Ok((execution, outcome)) = joined else {
                warn!(job = %self.job_id, "deployment task panicked");
                continue;
            };
            if let Err(e) = outcome {
                if let Some(slot) = execution.take_slot() {
                    self.slot_provider.release_slot(&slot);
                }
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Schedule and deploy every created replica, group by group in
    /// creation order so upstream attempts are placed first.
    pub async fn schedule_all(&self, blob_keys: &BlobSet, timeout: Duration) -> GraphResult<()> {
        let plan: Vec<(JobVertexId, Vec<usize>, Vec<ExecutionAttemptId>)> = {
            let state = self.lock();
            state
                .tasks_in_order()
                .map(|group| {
                    let ordinals = group
                        .replicas()
                        .iter()
                        .filter(|r| r.execution_state() == ExecutionState::Created)
                        .map(|r| r.subtask_index())
                        .collect();
                    let upstream = group
                        .inputs()
                        .iter()
                        .filter_map(|id| state.result(*id))
                        .filter_map(|r| state.task(r.producer()))
                        .flat_map(|t| t.current_attempts())
                        .map(|e| e.attempt_id())
                        .collect();
                    (group.id(), ordinals, upstream)
                })
                .collect()
        };

        for (vertex, ordinals, upstream) in plan {
            if ordinals.is_empty() {
                continue;
            }
            let preferred = self.locations_of(&upstream);
            let pending = self.schedule_replicas(vertex, &ordinals, &preferred, blob_keys)?;
            self.deploy(pending, timeout).await?;
        }
        self.set_status(JobStatus::Running);
        Ok(())
    }

    // ── Failure ─────────────────────────────────────────────────────

    /// Record a global failure and fail every replica group.
    pub fn fail_global(&self, cause: &dyn fmt::Display) {
        let message = cause.to_string();
        error!(job = %self.job_id, cause = %message, "job failed globally");
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                *failure = Some(FailureCause {
                    message,
                    at: epoch_millis(),
                });
            }
        }
        self.set_status(JobStatus::Failing);
        for group in self.lock().tasks_in_order() {
            group.fail();
        }
    }

    /// Cancel every attempt of a group and give their slots back.
    pub async fn cancel_group(&self, vertex: JobVertexId, timeout: Duration) -> GraphResult<()> {
        let attempts = self.current_attempts(vertex)?;
        let mut set = JoinSet::new();
        for exec in attempts.iter().cloned() {
            set.spawn(async move { exec.cancel(timeout).await });
        }
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            if let Ok(Err(e)) = joined {
                first_error.get_or_insert(e);
            }
        }
        for exec in &attempts {
            if let Some(slot) = exec.take_slot() {
                self.slot_provider.release_slot(&slot);
            }
        }
        debug!(job = %self.job_id, %vertex, replicas = attempts.len(), "group canceled");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Give every replica of a terminated group a fresh attempt. The
    /// previous attempts move to each replica's history and leave the
    /// attempt registry.
    pub fn reset_group(&self, vertex: JobVertexId) -> GraphResult<Vec<Arc<Execution>>> {
        let mut guard = self.lock();
        let GraphState {
            tasks, registered, ..
        } = &mut *guard;
        let group = tasks.get_mut(&vertex).ok_or(GraphError::UnknownVertex(vertex))?;
        let previous = group.current_attempts();
        let fresh = group.reset_for_new_execution()?;
        for exec in &previous {
            registered.remove(&exec.attempt_id());
        }
        for exec in &fresh {
            registered.insert(exec.attempt_id(), Arc::clone(exec));
        }
        self.global_mod_version.fetch_add(1, Ordering::AcqRel);
        info!(job = %self.job_id, %vertex, replicas = fresh.len(), "group reset for new execution");
        Ok(fresh)
    }

    /// Record that an attempt's run loop ended on its own. Only
    /// `Finished` and `Failed` are taken, and only for attempts that are
    /// not terminal yet. The attempt's slot is given back.
    pub fn update_task_state(&self, attempt: ExecutionAttemptId, state: ExecutionState) -> bool {
        if !matches!(state, ExecutionState::Finished | ExecutionState::Failed) {
            warn!(job = %self.job_id, %attempt, %state, "ignoring task state update");
            return false;
        }
        let Some(exec) = self.lock().registered_attempt(attempt).cloned() else {
            debug!(job = %self.job_id, %attempt, "task state update for unknown attempt");
            return false;
        };
        let current = exec.state();
        if current.is_terminal() || !exec.transition_state(current, state) {
            return false;
        }
        if let Some(slot) = exec.take_slot() {
            self.slot_provider.release_slot(&slot);
        }
        if state == ExecutionState::Failed {
            warn!(job = %self.job_id, %attempt, task = exec.task_name(), "attempt failed on its worker");
        } else {
            info!(job = %self.job_id, %attempt, task = exec.task_name(), "attempt finished");
        }
        true
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.lock().snapshot()
    }

    pub fn total_number_of_vertices(&self) -> usize {
        self.lock().tasks_in_order().map(ExecutionJobVertex::parallelism).sum()
    }

    /// Number of groups whose replicas all finished.
    pub fn vertices_finished(&self) -> usize {
        self.lock()
            .tasks_in_order()
            .filter(|t| t.aggregate_state() == ExecutionState::Finished)
            .count()
    }

    pub fn json_plan(&self) -> serde_json::Value {
        let state = self.lock();
        let nodes: Vec<serde_json::Value> = state
            .tasks_in_order()
            .map(|group| {
                let inputs: Vec<serde_json::Value> = group
                    .job_vertex()
                    .inputs
                    .iter()
                    .map(|edge| {
                        serde_json::json!({
                            "id": edge.source_id,
                            "producer": state.result(edge.source_id).map(IntermediateResult::producer),
                            "ship_strategy": edge.pattern,
                        })
                    })
                    .collect();
                serde_json::json!({
                    "id": group.id(),
                    "name": group.name(),
                    "parallelism": group.parallelism(),
                    "max_parallelism": group.max_parallelism(),
                    "max_parallelism_configured": group.is_max_parallelism_configured(),
                    "state": group.aggregate_state(),
                    "inputs": inputs,
                })
            })
            .collect();
        serde_json::json!({
            "jid": self.job_id,
            "name": self.job_name,
            "status": self.status(),
            "nodes": nodes,
        })
    }
}
