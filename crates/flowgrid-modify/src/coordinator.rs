//! The modification coordinator.
//!
//! Resolves operator roles to replica groups, fans control calls out to
//! their current attempts, splices new operators into the running graph,
//! and correlates worker acknowledgements with pending modifications.
//!
//! ```text
//!   ModifyOptions ──► execute ──► pause / resume ──► Execution::pause ─┐
//!                             ├─► trigger ─────────► source replicas   │
//!                             ├─► insert ──► splice → schedule → deploy│
//!                             ├─► grow ────► grow   → schedule → deploy│
//!                             └─► restart ─► cancel → reset → deploy   │
//!                                                                      ▼
//!   ModificationResponse ◄── worker run loops ◄──── markers / control calls
//!          │
//!          ├──► PendingTable (ack / decline / expire)
//!          └──► ExecutionGraph (attempts that finished or failed)
//! ```
//!
//! Pause, resume, and trigger targets must consume exactly one dataset,
//! and a trigger source must produce exactly one. Structural violations
//! and failed lookups fail the job globally, since the graph can no
//! longer be trusted to match what runs on the workers. Failed control
//! calls are reported per attempt and leave the job alone.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flow_core::config::CoordinatorConfig;
use flow_core::{BlobKey, BlobSet, ExecutionAttemptId, JobVertexId, ModificationId};
use flowgrid_graph::{
    AcknowledgeModification, DeclineModification, DistributionPattern, Execution, ExecutionGraph,
    GraphError, GraphResult, JobStatus, JobVertex, ModificationResponse, ResultPartitionType,
    TaskStateUpdate,
};
use flowgrid_task::operator::ONE_INPUT_TASK;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ModifyError, ModifyResult};
use crate::options::{ModifyCommand, ModifyOptions};
use crate::pending::{Acknowledgement, ModificationKind, ModificationOutcome, PendingTable};
use crate::plan;

/// Role tag carried by operators spliced in at runtime.
pub const INSERTED_ROLE: &str = "inserted";

const INSERTED_NAME: &str = "Inserted Operator";

/// How often the run loop drops overdue modifications.
const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_millis(500);

// ── Reports ─────────────────────────────────────────────────────────

/// Per-attempt result of a pause, resume, or trigger fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlReport {
    pub modification_id: ModificationId,
    pub kind: ModificationKind,
    pub vertex: JobVertexId,
    pub acknowledged: Vec<ExecutionAttemptId>,
    pub failed: Vec<(ExecutionAttemptId, String)>,
}

impl ControlReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsertReport {
    pub modification_id: ModificationId,
    pub vertex: JobVertexId,
    pub name: String,
    pub upstream: JobVertexId,
    pub attempts: Vec<ExecutionAttemptId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrowReport {
    pub modification_id: ModificationId,
    pub vertex: JobVertexId,
    pub ordinal: usize,
    pub attempt: ExecutionAttemptId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartReport {
    pub modification_id: ModificationId,
    pub vertex: JobVertexId,
    /// Canceled attempts, now in the replicas' history.
    pub previous: Vec<ExecutionAttemptId>,
    pub attempts: Vec<ExecutionAttemptId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ModifyOutcome {
    Control(ControlReport),
    Inserted(InsertReport),
    Grown(GrowReport),
    Restarted(RestartReport),
    Plan { plan: String },
}

impl fmt::Display for ModifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModifyOutcome::Control(r) => {
                write!(
                    f,
                    "{} {} on {}: {} acknowledged",
                    r.kind,
                    r.modification_id,
                    r.vertex,
                    r.acknowledged.len()
                )?;
                for (attempt, reason) in &r.failed {
                    write!(f, "\n  {attempt} failed: {reason}")?;
                }
                Ok(())
            }
            ModifyOutcome::Inserted(r) => write!(
                f,
                "inserted '{}' ({}) after {} with {} replicas",
                r.name,
                r.vertex,
                r.upstream,
                r.attempts.len()
            ),
            ModifyOutcome::Grown(r) => write!(
                f,
                "grew {} to replica {} ({})",
                r.vertex, r.ordinal, r.attempt
            ),
            ModifyOutcome::Restarted(r) => write!(
                f,
                "restarted {} with {} fresh attempts",
                r.vertex,
                r.attempts.len()
            ),
            ModifyOutcome::Plan { plan } => f.write_str(plan),
        }
    }
}

// ── Coordinator ─────────────────────────────────────────────────────

pub struct ModificationCoordinator {
    graph: Arc<ExecutionGraph>,
    rpc_timeout: Duration,
    modification_timeout: Duration,
    inserted_invokable: String,
    blob_keys: Mutex<BlobSet>,
    pending: PendingTable,
}

impl fmt::Debug for ModificationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModificationCoordinator")
            .field("job_id", &self.graph.job_id())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ModificationCoordinator {
    pub fn new(graph: Arc<ExecutionGraph>, config: &CoordinatorConfig) -> ModifyResult<Self> {
        Ok(Self::with_timeouts(
            graph,
            config.rpc_timeout()?,
            config.modification_timeout()?,
        ))
    }

    pub fn with_timeouts(
        graph: Arc<ExecutionGraph>,
        rpc_timeout: Duration,
        modification_timeout: Duration,
    ) -> Self {
        Self {
            graph,
            rpc_timeout,
            modification_timeout,
            inserted_invokable: ONE_INPUT_TASK.to_string(),
            blob_keys: Mutex::new(BlobSet::new()),
            pending: PendingTable::new(),
        }
    }

    /// Operator implementation used for spliced-in vertices.
    pub fn with_inserted_invokable(mut self, invokable: &str) -> Self {
        self.inserted_invokable = invokable.to_string();
        self
    }

    pub fn graph(&self) -> &Arc<ExecutionGraph> {
        &self.graph
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Remember resources that newly deployed operators need on their
    /// workers.
    pub fn record_new_operator_resources(&self, keys: impl IntoIterator<Item = BlobKey>) {
        let mut blob_keys = self.blob_keys.lock().unwrap_or_else(PoisonError::into_inner);
        let before = blob_keys.len();
        blob_keys.extend(keys);
        debug!(job = %self.graph.job_id(), added = blob_keys.len() - before, "operator resources recorded");
    }

    pub fn blob_keys(&self) -> BlobSet {
        self.blob_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn describe_current_plan(&self) -> String {
        plan::describe(&self.graph, &self.pending.snapshot())
    }

    /// Drop modifications whose deadline passed.
    pub fn expire_overdue(&self) -> Vec<ModificationOutcome> {
        self.pending.expire_overdue(Instant::now())
    }

    // ── Pause / resume / trigger ────────────────────────────────────

    pub async fn pause_operator(&self, role: &str) -> ModifyResult<ControlReport> {
        self.ensure_not_failed()?;
        let (vertex, attempts) = self.locate(role, Expect::OneInput)?;
        info!(job = %self.graph.job_id(), role, %vertex, replicas = attempts.len(), "pausing operator");
        let timeout = self.rpc_timeout;
        self.control(ModificationKind::Pause, vertex, attempts, move |exec| async move {
            exec.pause(timeout).await
        })
        .await
    }

    pub async fn resume_operator(&self, role: &str) -> ModifyResult<ControlReport> {
        self.ensure_not_failed()?;
        let (vertex, attempts) = self.locate(role, Expect::OneInput)?;
        info!(job = %self.graph.job_id(), role, %vertex, replicas = attempts.len(), "resuming operator");
        let timeout = self.rpc_timeout;
        self.control(ModificationKind::Resume, vertex, attempts, move |exec| async move {
            exec.resume(timeout).await
        })
        .await
    }

    /// Inject a modification marker at every replica of the source
    /// operator. The marker targets the current attempts of the target
    /// operator, which acknowledge it once it reaches them.
    pub async fn trigger_modification(
        &self,
        source_role: &str,
        target_role: &str,
    ) -> ModifyResult<ControlReport> {
        self.ensure_not_failed()?;
        let (source, sources) = self.locate(source_role, Expect::OneOutput)?;
        let (target, targets) = self.locate(target_role, Expect::OneInput)?;

        let timestamp = epoch_millis();
        let id = self.pending.begin(
            ModificationKind::Trigger,
            timestamp,
            targets.iter().map(|e| e.attempt_id()),
            self.modification_timeout,
        );
        info!(
            job = %self.graph.job_id(),
            modification = %id,
            %source,
            %target,
            sources = sources.len(),
            targets = targets.len(),
            "triggering modification"
        );

        let timeout = self.rpc_timeout;
        let (acknowledged, failed) = fan_out(sources, move |exec| async move {
            exec.trigger_modification(id, timestamp, vec![target], timeout)
                .await
        })
        .await;
        if acknowledged.is_empty() {
            // No marker entered the stream, so no target can ever see it.
            self.pending.abandon(id);
        }
        Ok(ControlReport {
            modification_id: id,
            kind: ModificationKind::Trigger,
            vertex: source,
            acknowledged,
            failed,
        })
    }

    // ── Insert / grow ───────────────────────────────────────────────

    /// Splice a new operator after `after_role`, consuming its single
    /// produced dataset, and deploy it next to the upstream replicas.
    pub async fn insert_operator(&self, after_role: &str) -> ModifyResult<InsertReport> {
        self.ensure_not_failed()?;
        let upstream = self
            .graph
            .find_by_role(after_role)
            .map_err(|e| self.escalate(e))?;
        let (vertex, upstream_attempts) = self
            .prepare_insert(upstream)
            .map_err(|e| self.escalate(e))?;
        let name = vertex.name.clone();
        let parallelism = vertex.parallelism;

        let vertex_id = self
            .graph
            .splice_vertex(vertex)
            .map_err(|e| self.escalate(e))?;
        let attempts: Vec<ExecutionAttemptId> = self
            .graph
            .current_attempts(vertex_id)
            .map_err(|e| self.escalate(e))?
            .iter()
            .map(|e| e.attempt_id())
            .collect();
        let id = self.pending.begin(
            ModificationKind::Insert,
            epoch_millis(),
            attempts.iter().copied(),
            self.modification_timeout,
        );

        let preferred = self.graph.locations_of(&upstream_attempts);
        let ordinals: Vec<usize> = (0..parallelism).collect();
        self.schedule_and_deploy(id, vertex_id, &ordinals, &preferred)
            .await?;
        for attempt in &attempts {
            self.pending.acknowledge(id, *attempt);
        }

        info!(
            job = %self.graph.job_id(),
            modification = %id,
            vertex = %vertex_id,
            %name,
            %upstream,
            "operator inserted"
        );
        Ok(InsertReport {
            modification_id: id,
            vertex: vertex_id,
            name,
            upstream,
            attempts,
        })
    }

    /// Add one replica to the operator behind `role`.
    pub async fn grow_operator(&self, role: &str) -> ModifyResult<GrowReport> {
        self.ensure_not_failed()?;
        let vertex = self
            .graph
            .find_by_role(role)
            .map_err(|e| self.escalate(e))?;
        let siblings: Vec<ExecutionAttemptId> = self
            .graph
            .current_attempts(vertex)
            .map_err(|e| self.escalate(e))?
            .iter()
            .map(|e| e.attempt_id())
            .collect();

        let exec = self
            .graph
            .grow_parallelism(vertex)
            .map_err(|e| self.escalate(e))?;
        let ordinal = exec.subtask_index();
        let attempt = exec.attempt_id();
        let id = self.pending.begin(
            ModificationKind::Grow,
            epoch_millis(),
            [attempt],
            self.modification_timeout,
        );

        let preferred = self.graph.locations_of(&siblings);
        self.schedule_and_deploy(id, vertex, &[ordinal], &preferred)
            .await?;
        self.pending.acknowledge(id, attempt);

        info!(job = %self.graph.job_id(), modification = %id, %vertex, ordinal, %attempt, "operator grown");
        Ok(GrowReport {
            modification_id: id,
            vertex,
            ordinal,
            attempt,
        })
    }

    /// Cancel every replica of the operator behind `role` and deploy a
    /// fresh attempt for each. The new attempts write into the same result
    /// partitions, so consumers keep their channels; records buffered by
    /// the canceled attempts are lost.
    pub async fn restart_operator(&self, role: &str) -> ModifyResult<RestartReport> {
        self.ensure_not_failed()?;
        let vertex = self
            .graph
            .find_by_role(role)
            .map_err(|e| self.escalate(e))?;
        let previous: Vec<ExecutionAttemptId> = self
            .graph
            .current_attempts(vertex)
            .map_err(|e| self.escalate(e))?
            .iter()
            .map(|e| e.attempt_id())
            .collect();
        let preferred = self.graph.locations_of(&previous);
        info!(job = %self.graph.job_id(), role, %vertex, replicas = previous.len(), "restarting operator");

        // Past this point the group is down, so any failure fails the job.
        let reset = match self.graph.cancel_group(vertex, self.rpc_timeout).await {
            Ok(()) => self.graph.reset_group(vertex),
            Err(e) => Err(e),
        };
        let attempts: Vec<ExecutionAttemptId> = match reset {
            Ok(fresh) => fresh.iter().map(|e| e.attempt_id()).collect(),
            Err(e) => {
                self.graph.fail_global(&e);
                return Err(e.into());
            }
        };
        let id = self.pending.begin(
            ModificationKind::Restart,
            epoch_millis(),
            attempts.iter().copied(),
            self.modification_timeout,
        );

        let ordinals: Vec<usize> = (0..attempts.len()).collect();
        self.schedule_and_deploy(id, vertex, &ordinals, &preferred)
            .await?;
        for attempt in &attempts {
            self.pending.acknowledge(id, *attempt);
        }

        info!(job = %self.graph.job_id(), modification = %id, %vertex, "operator restarted");
        Ok(RestartReport {
            modification_id: id,
            vertex,
            previous,
            attempts,
        })
    }

    // ── Worker responses ────────────────────────────────────────────

    /// Returns whether the acknowledgement belonged to a pending
    /// modification.
    pub fn receive_acknowledge_message(&self, ack: &AcknowledgeModification) -> bool {
        if ack.job_id != self.graph.job_id() {
            warn!(job = %self.graph.job_id(), other = %ack.job_id, "acknowledgement for another job");
            return false;
        }
        let outcome = self
            .pending
            .acknowledge(ack.modification_id, ack.attempt_id);
        match &outcome {
            Acknowledgement::UnknownModification => {
                debug!(modification = %ack.modification_id, attempt = %ack.attempt_id, "acknowledgement for unknown modification");
                return false;
            }
            Acknowledgement::NotATarget => {
                warn!(modification = %ack.modification_id, attempt = %ack.attempt_id, "acknowledgement from attempt outside the target set");
                return false;
            }
            Acknowledgement::Recorded { .. } | Acknowledgement::Completed(_) => {}
        }

        // A trigger target resumes as soon as the marker reaches it.
        if outcome.kind() == Some(ModificationKind::Trigger)
            && let Some(exec) = self.graph.lock().registered_attempt(ack.attempt_id)
        {
            exec.mark_resumed();
        }
        if let Acknowledgement::Completed(ModificationOutcome::Completed { id, kind }) = outcome {
            info!(job = %self.graph.job_id(), modification = %id, %kind, "all targets acknowledged");
        }
        true
    }

    pub fn receive_decline_message(&self, decline: &DeclineModification) -> bool {
        if decline.job_id != self.graph.job_id() {
            warn!(job = %self.graph.job_id(), other = %decline.job_id, "decline for another job");
            return false;
        }
        self.pending
            .decline(decline.modification_id, decline.attempt_id, &decline.reason)
            .is_some()
    }

    /// Record an attempt whose run loop ended on its own.
    pub fn receive_task_state(&self, update: &TaskStateUpdate) -> bool {
        if update.job_id != self.graph.job_id() {
            warn!(job = %self.graph.job_id(), other = %update.job_id, "task state for another job");
            return false;
        }
        self.graph.update_task_state(update.attempt_id, update.state)
    }

    pub fn handle_response(&self, response: &ModificationResponse) -> bool {
        match response {
            ModificationResponse::Acknowledge(ack) => self.receive_acknowledge_message(ack),
            ModificationResponse::Decline(decline) => self.receive_decline_message(decline),
            ModificationResponse::TaskState(update) => self.receive_task_state(update),
        }
    }

    /// Consume worker responses and expire overdue modifications until
    /// shutdown.
    pub async fn run(
        &self,
        mut responses: mpsc::UnboundedReceiver<ModificationResponse>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(job = %self.graph.job_id(), "modification coordinator started");
        loop {
            tokio::select! {
                Some(response) = responses.recv() => {
                    self.handle_response(&response);
                }
                _ = tokio::time::sleep(EXPIRY_CHECK_INTERVAL) => {
                    for outcome in self.expire_overdue() {
                        warn!(job = %self.graph.job_id(), modification = %outcome.id(), "modification expired");
                    }
                }
                _ = shutdown.changed() => {
                    info!(job = %self.graph.job_id(), "modification coordinator shutting down");
                    break;
                }
            }
        }
    }

    /// Run a parsed command-line request.
    pub async fn execute(&self, options: &ModifyOptions) -> ModifyResult<ModifyOutcome> {
        let command = options.parse()?;
        debug!(job = %self.graph.job_id(), %command, "executing modify command");
        let outcome = match command {
            ModifyCommand::Pause { role } => ModifyOutcome::Control(self.pause_operator(&role).await?),
            ModifyCommand::Resume { role } => {
                ModifyOutcome::Control(self.resume_operator(&role).await?)
            }
            ModifyCommand::Trigger {
                source_role,
                target_role,
            } => ModifyOutcome::Control(
                self.trigger_modification(&source_role, &target_role)
                    .await?,
            ),
            ModifyCommand::Insert { after_role } => {
                ModifyOutcome::Inserted(self.insert_operator(&after_role).await?)
            }
            ModifyCommand::Grow { role } => ModifyOutcome::Grown(self.grow_operator(&role).await?),
            ModifyCommand::Restart { role } => {
                ModifyOutcome::Restarted(self.restart_operator(&role).await?)
            }
            ModifyCommand::Describe => ModifyOutcome::Plan {
                plan: self.describe_current_plan(),
            },
        };
        Ok(outcome)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn ensure_not_failed(&self) -> ModifyResult<()> {
        match self.graph.status() {
            JobStatus::Failing | JobStatus::Failed => {
                let cause = self
                    .graph
                    .failure_cause()
                    .map(|c| c.message)
                    .unwrap_or_else(|| self.graph.status().to_string());
                Err(ModifyError::JobFailed(cause))
            }
            _ => Ok(()),
        }
    }

    fn escalate(&self, error: GraphError) -> ModifyError {
        if error.is_structural() || error.is_lookup() {
            self.graph.fail_global(&error);
        }
        error.into()
    }

    /// Resolve `role` to its group and current attempts, checking the
    /// group's shape.
    fn locate(&self, role: &str, expect: Expect) -> ModifyResult<(JobVertexId, Vec<Arc<Execution>>)> {
        let located = self
            .graph
            .find_by_role(role)
            .and_then(|vertex| self.check_shape(vertex, expect).map(|attempts| (vertex, attempts)));
        located.map_err(|e| self.escalate(e))
    }

    fn check_shape(&self, vertex: JobVertexId, expect: Expect) -> GraphResult<Vec<Arc<Execution>>> {
        let state = self.graph.lock();
        let group = state.task(vertex).ok_or(GraphError::UnknownVertex(vertex))?;
        let (what, found) = match expect {
            Expect::OneInput => ("consumed datasets", group.inputs().len()),
            Expect::OneOutput => ("produced datasets", group.produced_data_sets().len()),
        };
        if found != 1 {
            return Err(GraphError::UnexpectedShape {
                vertex: group.name().to_string(),
                what,
                expected: 1,
                found,
            });
        }
        Ok(group.current_attempts())
    }

    /// Build the vertex to splice after `upstream`. Touches no registry.
    fn prepare_insert(
        &self,
        upstream: JobVertexId,
    ) -> GraphResult<(JobVertex, Vec<ExecutionAttemptId>)> {
        let state = self.graph.lock();
        let group = state
            .task(upstream)
            .ok_or(GraphError::UnknownVertex(upstream))?;
        let produced = &group.job_vertex().produced;
        let [dataset] = produced.as_slice() else {
            return Err(GraphError::UnexpectedShape {
                vertex: group.name().to_string(),
                what: "produced datasets",
                expected: 1,
                found: produced.len(),
            });
        };

        let mut vertex = JobVertex::new(INSERTED_NAME)
            .set_parallelism(group.parallelism())
            .set_invokable(&self.inserted_invokable)
            .add_role(INSERTED_ROLE);
        vertex.connect_data_set_as_input(dataset, DistributionPattern::AllToAll);
        vertex.create_and_add_result_data_set(ResultPartitionType::Pipelined);

        let attempts = group.current_attempts().iter().map(|e| e.attempt_id()).collect();
        Ok((vertex, attempts))
    }

    /// Replicas already spliced into the graph must run, so any failure
    /// here fails the job.
    async fn schedule_and_deploy(
        &self,
        id: ModificationId,
        vertex: JobVertexId,
        ordinals: &[usize],
        preferred: &[String],
    ) -> ModifyResult<()> {
        let blob_keys = self.blob_keys();
        let deployed = match self
            .graph
            .schedule_replicas(vertex, ordinals, preferred, &blob_keys)
        {
            Ok(pending) => self.graph.deploy(pending, self.rpc_timeout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = deployed {
            self.pending.abandon(id);
            self.graph.fail_global(&e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn control<F, Fut>(
        &self,
        kind: ModificationKind,
        vertex: JobVertexId,
        attempts: Vec<Arc<Execution>>,
        call: F,
    ) -> ModifyResult<ControlReport>
    where
        F: Fn(Arc<Execution>) -> Fut,
        Fut: Future<Output = GraphResult<()>> + Send + 'static,
    {
        let id = self.pending.begin(
            kind,
            epoch_millis(),
            attempts.iter().map(|e| e.attempt_id()),
            self.modification_timeout,
        );
        let (acknowledged, failed) = fan_out(attempts, call).await;
        for attempt in &acknowledged {
            self.pending.acknowledge(id, *attempt);
        }
        if !failed.is_empty() {
            self.pending.abandon(id);
        }
        Ok(ControlReport {
            modification_id: id,
            kind,
            vertex,
            acknowledged,
            failed,
        })
    }
}

/// Shape a located group must have.
#[derive(Debug, Clone, Copy)]
enum Expect {
    OneInput,
    OneOutput,
}

/// Run `call` for every attempt concurrently. Returns the attempts that
/// succeeded and the ones that failed, each in attempt order.
async fn fan_out<F, Fut>(
    attempts: Vec<Arc<Execution>>,
    call: F,
) -> (Vec<ExecutionAttemptId>, Vec<(ExecutionAttemptId, String)>)
where
    F: Fn(Arc<Execution>) -> Fut,
    Fut: Future<Output = GraphResult<()>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for exec in attempts {
        let attempt = exec.attempt_id();
        let fut = call(exec);
        set.spawn(async move { (attempt, fut.await) });
    }

    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((attempt, Ok(()))) => succeeded.push(attempt),
            Ok((attempt, Err(e))) => {
                warn!(%attempt, error = %e, "control call failed");
                failed.push((attempt, e.to_string()));
            }
            Err(e) => warn!(error = %e, "control call task panicked"),
        }
    }
    succeeded.sort();
    failed.sort_by_key(|(attempt, _)| *attempt);
    (succeeded, failed)
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use flow_core::JobId;
    use flowgrid_graph::{
        ExecutionState, GatewayError, GatewayFuture, JobGraph, SlotPool, TaskDeploymentDescriptor,
        TaskGateway,
    };
    use flowgrid_task::operator::SOURCE_TASK;
    use flowgrid_task::{Invokable, LocalTaskExecutor, OperatorRegistry, RunState, TaskResult};
    use serde_json::{Value, json};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Harness {
        coordinator: Arc<ModificationCoordinator>,
        executor: Arc<LocalTaskExecutor>,
        responses: mpsc::UnboundedReceiver<ModificationResponse>,
    }

    impl Harness {
        async fn shutdown(self) {
            self.executor.shutdown().await;
        }
    }

    fn vertex(name: &str, parallelism: usize, invokable: &str, role: &str) -> JobVertex {
        JobVertex::new(name)
            .set_parallelism(parallelism)
            .set_invokable(invokable)
            .add_role(role)
    }

    /// Source(2) → Map(2), deployed on one in-process worker.
    fn pipeline() -> JobGraph {
        let mut job = JobGraph::new("pipeline");
        let mut source = vertex("Source: Sequence", 2, SOURCE_TASK, "source");
        source.create_and_add_result_data_set(ResultPartitionType::Pipelined);
        let mut map = vertex("Map", 2, ONE_INPUT_TASK, "map");
        map.connect_data_set_as_input(&source.produced[0], DistributionPattern::AllToAll);
        map.create_and_add_result_data_set(ResultPartitionType::Pipelined);
        job.add_vertex(source);
        job.add_vertex(map);
        job
    }

    /// Source(1) and Other(1) → Map(1): a target consuming two datasets.
    fn merge() -> JobGraph {
        let mut job = JobGraph::new("merge");
        let mut source = vertex("Source: A", 1, SOURCE_TASK, "source");
        source.create_and_add_result_data_set(ResultPartitionType::Pipelined);
        let mut other = vertex("Source: B", 1, SOURCE_TASK, "other");
        other.create_and_add_result_data_set(ResultPartitionType::Pipelined);
        let mut map = vertex("Map", 1, ONE_INPUT_TASK, "map");
        map.connect_data_set_as_input(&source.produced[0], DistributionPattern::AllToAll);
        map.connect_data_set_as_input(&other.produced[0], DistributionPattern::AllToAll);
        job.add_vertex(source);
        job.add_vertex(other);
        job.add_vertex(map);
        job
    }

    /// Emits a fixed number of records, then ends.
    struct Bounded(u64);

    impl Invokable for Bounded {
        fn is_source(&self) -> bool {
            true
        }

        fn next_record(&mut self) -> Option<Value> {
            self.0 = self.0.checked_sub(1)?;
            Some(json!(self.0))
        }

        fn process(&mut self, record: Value) -> TaskResult<Vec<Value>> {
            Ok(vec![record])
        }
    }

    async fn deployed(job: &JobGraph, slots: u32) -> Harness {
        deployed_with(job, slots, OperatorRegistry::with_defaults()).await
    }

    async fn deployed_with(job: &JobGraph, slots: u32, registry: OperatorRegistry) -> Harness {
        let (tx, responses) = mpsc::unbounded_channel();
        let executor = Arc::new(
            LocalTaskExecutor::new("local-0", registry, tx)
                .with_source_interval(Duration::from_millis(1)),
        );
        let pool = Arc::new(SlotPool::new());
        pool.register_worker(executor.clone(), slots);
        let graph = Arc::new(ExecutionGraph::from_job_graph(job, pool, 4).unwrap());
        graph.schedule_all(&BlobSet::new(), TIMEOUT).await.unwrap();
        let coordinator = Arc::new(ModificationCoordinator::with_timeouts(
            graph,
            TIMEOUT,
            Duration::from_secs(10),
        ));
        Harness {
            coordinator,
            executor,
            responses,
        }
    }

    fn attempts_of(coordinator: &ModificationCoordinator, role: &str) -> Vec<Arc<Execution>> {
        let graph = coordinator.graph();
        graph.current_attempts(graph.find_by_role(role).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn pause_and_resume_reach_every_replica() {
        let h = deployed(&pipeline(), 8).await;

        let report = h.coordinator.pause_operator("map").await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.acknowledged.len(), 2);
        assert!(!h.coordinator.pending().contains(report.modification_id));
        for exec in attempts_of(&h.coordinator, "map") {
            assert_eq!(exec.state(), ExecutionState::Paused);
            assert!(
                h.executor
                    .wait_for_state(exec.attempt_id(), RunState::PausedForModification, TIMEOUT)
                    .await
            );
        }
        for exec in attempts_of(&h.coordinator, "source") {
            assert_eq!(exec.state(), ExecutionState::Running);
        }

        let report = h.coordinator.resume_operator("map").await.unwrap();
        assert!(report.is_complete());
        for exec in attempts_of(&h.coordinator, "map") {
            assert_eq!(exec.state(), ExecutionState::Running);
            assert!(
                h.executor
                    .wait_for_state(exec.attempt_id(), RunState::Running, TIMEOUT)
                    .await
            );
        }
        h.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_completes_when_every_target_acknowledges() {
        let mut h = deployed(&pipeline(), 8).await;
        h.coordinator.pause_operator("map").await.unwrap();

        let report = h
            .coordinator
            .trigger_modification("source", "map")
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.acknowledged.len(), 2);
        let id = report.modification_id;
        assert!(h.coordinator.pending().contains(id));

        while h.coordinator.pending().contains(id) {
            let response = tokio::time::timeout(TIMEOUT, h.responses.recv())
                .await
                .expect("acknowledgement in time")
                .expect("response channel open");
            h.coordinator.handle_response(&response);
        }

        for exec in attempts_of(&h.coordinator, "map") {
            assert_eq!(exec.state(), ExecutionState::Running);
            assert!(
                h.executor
                    .wait_for_state(exec.attempt_id(), RunState::Running, TIMEOUT)
                    .await
            );
        }
        h.shutdown().await;
    }

    #[tokio::test]
    async fn acknowledgement_only_counts_for_pending_ids() {
        let h = deployed(&pipeline(), 8).await;
        let job_id = h.coordinator.graph().job_id();
        let target = attempts_of(&h.coordinator, "map")[0].attempt_id();
        h.coordinator.pending().insert(crate::pending::PendingModification::new(
            ModificationId::from_raw(123),
            ModificationKind::Trigger,
            0,
            [target, ExecutionAttemptId::from_raw(u64::MAX)],
            Duration::from_secs(60),
        ));

        let ack = |id: u64| AcknowledgeModification {
            job_id,
            attempt_id: target,
            modification_id: ModificationId::from_raw(id),
        };
        assert!(h.coordinator.receive_acknowledge_message(&ack(123)));
        assert!(!h.coordinator.receive_acknowledge_message(&ack(999)));

        let other_job = AcknowledgeModification {
            job_id: JobId::from_raw(job_id.as_raw() + 1),
            ..ack(123)
        };
        assert!(!h.coordinator.receive_acknowledge_message(&other_job));

        let decline = DeclineModification {
            job_id,
            attempt_id: target,
            modification_id: ModificationId::from_raw(123),
            reason: "operator refused".into(),
        };
        assert!(h.coordinator.receive_decline_message(&decline));
        assert!(!h.coordinator.pending().contains(ModificationId::from_raw(123)));
        h.shutdown().await;
    }

    #[tokio::test]
    async fn acknowledgement_from_non_target_is_rejected() {
        let h = deployed(&pipeline(), 8).await;
        h.coordinator.pause_operator("map").await.unwrap();
        let job_id = h.coordinator.graph().job_id();
        let maps = attempts_of(&h.coordinator, "map");
        let id = ModificationId::from_raw(77);
        h.coordinator.pending().insert(crate::pending::PendingModification::new(
            id,
            ModificationKind::Trigger,
            0,
            [maps[0].attempt_id()],
            Duration::from_secs(60),
        ));
        let ack = |attempt_id: ExecutionAttemptId| AcknowledgeModification {
            job_id,
            attempt_id,
            modification_id: id,
        };

        assert!(!h.coordinator.receive_acknowledge_message(&ack(maps[1].attempt_id())));
        assert_eq!(maps[1].state(), ExecutionState::Paused);
        assert!(h.coordinator.pending().get(id).unwrap().acknowledged.is_empty());

        assert!(h.coordinator.receive_acknowledge_message(&ack(maps[0].attempt_id())));
        assert_eq!(maps[0].state(), ExecutionState::Running);
        assert_eq!(maps[1].state(), ExecutionState::Paused);
        assert!(!h.coordinator.pending().contains(id));
        h.shutdown().await;
    }

    #[tokio::test]
    async fn only_trigger_acknowledgements_resume_attempts() {
        let h = deployed(&pipeline(), 8).await;
        h.coordinator.pause_operator("map").await.unwrap();
        let job_id = h.coordinator.graph().job_id();
        let map = attempts_of(&h.coordinator, "map")[1].clone();
        let id = h.coordinator.pending().begin(
            ModificationKind::Pause,
            0,
            [map.attempt_id()],
            Duration::from_secs(60),
        );

        assert!(h.coordinator.receive_acknowledge_message(&AcknowledgeModification {
            job_id,
            attempt_id: map.attempt_id(),
            modification_id: id,
        }));
        assert!(!h.coordinator.pending().contains(id));
        assert_eq!(map.state(), ExecutionState::Paused);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn pausing_operator_without_input_fails_job() {
        let h = deployed(&pipeline(), 8).await;
        let before = h.coordinator.graph().registry_snapshot();

        let err = h.coordinator.pause_operator("source").await.unwrap_err();
        assert!(matches!(
            err,
            ModifyError::Graph(GraphError::UnexpectedShape { what: "consumed datasets", found: 0, .. })
        ));
        assert_eq!(h.coordinator.graph().status(), JobStatus::Failing);
        assert_eq!(h.coordinator.graph().registry_snapshot(), before);
        assert!(h.coordinator.pending().is_empty());
        for exec in h.executor.running_attempts() {
            assert_eq!(h.executor.run_state(exec), Some(RunState::Running));
        }
        h.shutdown().await;
    }

    #[tokio::test]
    async fn pausing_operator_with_two_inputs_fails_job() {
        let h = deployed(&merge(), 8).await;
        let before = h.coordinator.graph().registry_snapshot();

        let err = h.coordinator.pause_operator("map").await.unwrap_err();
        assert!(matches!(
            err,
            ModifyError::Graph(GraphError::UnexpectedShape { what: "consumed datasets", found: 2, .. })
        ));
        assert_eq!(h.coordinator.graph().status(), JobStatus::Failing);
        assert_eq!(h.coordinator.graph().registry_snapshot(), before);
        assert!(h.coordinator.pending().is_empty());
        let map = attempts_of(&h.coordinator, "map")[0].attempt_id();
        assert_eq!(h.executor.run_state(map), Some(RunState::Running));
        h.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_into_operator_with_two_inputs_fails_job() {
        let h = deployed(&merge(), 8).await;

        let err = h
            .coordinator
            .trigger_modification("source", "map")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ModifyError::Graph(GraphError::UnexpectedShape { found: 2, .. })
        ));
        assert_eq!(h.coordinator.graph().status(), JobStatus::Failing);
        assert!(h.coordinator.pending().is_empty());
        h.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_from_source_with_two_outputs_fails_job() {
        let mut job = JobGraph::new("fan out");
        let mut source = vertex("Source: Sequence", 1, SOURCE_TASK, "source");
        source.create_and_add_result_data_set(ResultPartitionType::Pipelined);
        source.create_and_add_result_data_set(ResultPartitionType::Pipelined);
        let mut map = vertex("Map", 1, ONE_INPUT_TASK, "map");
        map.connect_data_set_as_input(&source.produced[0], DistributionPattern::AllToAll);
        job.add_vertex(source);
        job.add_vertex(map);
        let h = deployed(&job, 4).await;

        let err = h
            .coordinator
            .trigger_modification("source", "map")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ModifyError::Graph(GraphError::UnexpectedShape { what: "produced datasets", found: 2, .. })
        ));
        assert_eq!(h.coordinator.graph().status(), JobStatus::Failing);
        assert!(h.coordinator.pending().is_empty());
        h.shutdown().await;
    }

    #[tokio::test]
    async fn finished_attempts_are_recorded_in_the_graph() {
        let mut registry = OperatorRegistry::with_defaults();
        registry.register("test.Bounded", |_| Box::new(Bounded(3)));
        let mut job = JobGraph::new("bounded");
        let mut source = vertex("Source: Bounded", 1, "test.Bounded", "source");
        source.create_and_add_result_data_set(ResultPartitionType::Pipelined);
        let mut map = vertex("Map", 1, ONE_INPUT_TASK, "map");
        map.connect_data_set_as_input(&source.produced[0], DistributionPattern::AllToAll);
        job.add_vertex(source);
        job.add_vertex(map);
        let mut h = deployed_with(&job, 4, registry).await;

        let graph = h.coordinator.graph().clone();
        while graph.vertices_finished() < 2 {
            let response = tokio::time::timeout(TIMEOUT, h.responses.recv())
                .await
                .expect("task state in time")
                .expect("response channel open");
            assert!(h.coordinator.handle_response(&response));
        }
        for exec in attempts_of(&h.coordinator, "map") {
            assert_eq!(exec.state(), ExecutionState::Finished);
            assert!(exec.assigned_slot().is_none());
        }
        assert!(h.coordinator.describe_current_plan().contains("state FINISHED"));

        // Control calls on ended attempts fail per attempt.
        let report = h.coordinator.pause_operator("map").await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(graph.status(), JobStatus::Running);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn restart_replaces_attempts_in_freed_slots() {
        // Exactly enough slots for the initial deployment.
        let h = deployed(&pipeline(), 4).await;
        let old: Vec<ExecutionAttemptId> = attempts_of(&h.coordinator, "map")
            .iter()
            .map(|e| e.attempt_id())
            .collect();

        let report = h.coordinator.restart_operator("map").await.unwrap();
        assert_eq!(report.previous, old);
        assert_eq!(report.attempts.len(), 2);
        assert!(!h.coordinator.pending().contains(report.modification_id));

        let graph = h.coordinator.graph();
        {
            let state = graph.lock();
            for attempt in &old {
                assert!(state.registered_attempt(*attempt).is_none());
            }
            let replica = state.task(report.vertex).unwrap().replica(0).unwrap();
            assert_eq!(replica.current_attempt().attempt_number(), 1);
            assert_eq!(replica.prior_attempts().count(), 1);
        }
        for attempt in &report.attempts {
            assert!(h.executor.wait_for_state(*attempt, RunState::Running, TIMEOUT).await);
        }
        for attempt in &old {
            assert!(!h.executor.running_attempts().contains(attempt));
        }
        assert_eq!(graph.status(), JobStatus::Running);

        // The fresh attempts answer control calls.
        let pause = h.coordinator.pause_operator("map").await.unwrap();
        let mut fresh = report.attempts.clone();
        fresh.sort();
        assert_eq!(pause.acknowledged, fresh);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn restarting_a_producer_keeps_consumers_running() {
        let h = deployed(&pipeline(), 8).await;
        let maps = attempts_of(&h.coordinator, "map");

        let report = h.coordinator.restart_operator("source").await.unwrap();
        for attempt in &report.attempts {
            assert!(h.executor.wait_for_state(*attempt, RunState::Running, TIMEOUT).await);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        for exec in &maps {
            assert_eq!(h.executor.run_state(exec.attempt_id()), Some(RunState::Running));
            assert_eq!(exec.state(), ExecutionState::Running);
        }
        h.shutdown().await;
    }

    #[tokio::test]
    async fn insert_splices_operator_after_source() {
        let h = deployed(&pipeline(), 8).await;
        let source = h.coordinator.graph().find_by_role("source").unwrap();

        let report = h.coordinator.insert_operator("source").await.unwrap();
        assert_eq!(report.upstream, source);
        assert_eq!(report.attempts.len(), 2);
        assert!(!h.coordinator.pending().contains(report.modification_id));

        let graph = h.coordinator.graph();
        assert_eq!(graph.find_by_role(INSERTED_ROLE).unwrap(), report.vertex);
        assert_eq!(graph.find_by_role("source").unwrap(), source);
        {
            let state = graph.lock();
            let inserted = state.task(report.vertex).unwrap();
            assert_eq!(inserted.parallelism(), 2);
            assert_eq!(inserted.job_vertex().invokable, ONE_INPUT_TASK);
            let produced = state.task(source).unwrap().produced_data_sets()[0];
            let result = state.result(produced).unwrap();
            assert_eq!(result.num_consumers(), 2);
            assert_eq!(result.consumer_vertices()[1], report.vertex);
        }
        for attempt in &report.attempts {
            assert!(h.executor.wait_for_state(*attempt, RunState::Running, TIMEOUT).await);
        }
        assert_eq!(graph.status(), JobStatus::Running);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn insert_after_operator_without_output_fails_job() {
        let mut job = JobGraph::new("sink only");
        job.add_vertex(vertex("Source: Sequence", 1, SOURCE_TASK, "source"));
        let h = deployed(&job, 4).await;
        let before = h.coordinator.graph().registry_snapshot();

        let err = h.coordinator.insert_operator("source").await.unwrap_err();
        assert!(matches!(
            err,
            ModifyError::Graph(GraphError::UnexpectedShape { found: 0, .. })
        ));
        assert_eq!(h.coordinator.graph().status(), JobStatus::Failing);
        assert_eq!(h.coordinator.graph().registry_snapshot(), before);
        assert!(h.coordinator.pending().is_empty());

        // Nothing further is accepted once the job failed.
        assert!(matches!(
            h.coordinator.pause_operator("source").await.unwrap_err(),
            ModifyError::JobFailed(_)
        ));
        h.shutdown().await;
    }

    #[tokio::test]
    async fn insert_after_operator_with_two_outputs_fails_job() {
        let mut job = JobGraph::new("fan out");
        let mut source = vertex("Source: Sequence", 1, SOURCE_TASK, "source");
        source.create_and_add_result_data_set(ResultPartitionType::Pipelined);
        source.create_and_add_result_data_set(ResultPartitionType::Pipelined);
        job.add_vertex(source);
        let h = deployed(&job, 4).await;
        let before = h.coordinator.graph().registry_snapshot();

        let err = h.coordinator.insert_operator("source").await.unwrap_err();
        assert!(matches!(
            err,
            ModifyError::Graph(GraphError::UnexpectedShape { found: 2, .. })
        ));
        assert_eq!(h.coordinator.graph().status(), JobStatus::Failing);
        assert_eq!(h.coordinator.graph().registry_snapshot(), before);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn inserted_operator_the_worker_cannot_run_fails_job() {
        let mut h = deployed(&pipeline(), 8).await;
        let coordinator = ModificationCoordinator::with_timeouts(
            h.coordinator.graph().clone(),
            TIMEOUT,
            Duration::from_secs(10),
        )
        .with_inserted_invokable("flowgrid.Missing");
        h.coordinator = Arc::new(coordinator);

        let err = h.coordinator.insert_operator("source").await.unwrap_err();
        assert!(matches!(err, ModifyError::Graph(GraphError::Gateway { .. })));
        assert_eq!(h.coordinator.graph().status(), JobStatus::Failing);
        assert!(h.coordinator.pending().is_empty());
        h.shutdown().await;
    }

    #[tokio::test]
    async fn grow_adds_a_running_replica() {
        let h = deployed(&pipeline(), 8).await;

        let report = h.coordinator.grow_operator("map").await.unwrap();
        assert_eq!(report.ordinal, 2);
        let graph = h.coordinator.graph();
        assert_eq!(graph.lock().task(report.vertex).unwrap().parallelism(), 3);
        assert_eq!(graph.total_number_of_vertices(), 5);
        assert!(h.executor.wait_for_state(report.attempt, RunState::Running, TIMEOUT).await);
        assert!(h.executor.running_attempts().contains(&report.attempt));
        h.shutdown().await;
    }

    #[tokio::test]
    async fn grow_without_free_slot_fails_job() {
        let h = deployed(&pipeline(), 4).await;
        let err = h.coordinator.grow_operator("map").await.unwrap_err();
        assert!(matches!(
            err,
            ModifyError::Graph(GraphError::NoResourceAvailable { .. })
        ));
        assert_eq!(h.coordinator.graph().status(), JobStatus::Failing);
        assert!(h.coordinator.pending().is_empty());
        h.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_role_fails_job() {
        let h = deployed(&pipeline(), 8).await;
        let err = h.coordinator.pause_operator("window").await.unwrap_err();
        assert!(matches!(err, ModifyError::Graph(GraphError::RoleNotFound(ref r)) if r == "window"));
        assert_eq!(h.coordinator.graph().status(), JobStatus::Failing);
        assert!(h.coordinator.graph().failure_cause().is_some());
        h.shutdown().await;
    }

    /// Accepts deployments, never answers control calls.
    struct SilentGateway;

    impl TaskGateway for SilentGateway {
        fn location(&self) -> &str {
            "silent-0"
        }

        fn submit_task(&self, _descriptor: TaskDeploymentDescriptor) -> GatewayFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn cancel_task(&self, _attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn pause_task(&self, _attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()> {
            Box::pin(std::future::pending::<Result<(), GatewayError>>())
        }

        fn resume_task(&self, _attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()> {
            Box::pin(std::future::pending::<Result<(), GatewayError>>())
        }

        fn trigger_modification(
            &self,
            _attempt: ExecutionAttemptId,
            _modification: ModificationId,
            _timestamp: u64,
            _targets: Vec<JobVertexId>,
        ) -> GatewayFuture<'_, ()> {
            Box::pin(std::future::pending::<Result<(), GatewayError>>())
        }
    }

    #[tokio::test]
    async fn control_timeouts_are_reported_per_attempt() {
        let pool = Arc::new(SlotPool::new());
        pool.register_worker(Arc::new(SilentGateway), 8);
        let graph = Arc::new(ExecutionGraph::from_job_graph(&pipeline(), pool, 4).unwrap());
        graph.schedule_all(&BlobSet::new(), TIMEOUT).await.unwrap();
        let coordinator = ModificationCoordinator::with_timeouts(
            graph.clone(),
            Duration::from_millis(50),
            Duration::from_secs(10),
        );

        let report = coordinator.pause_operator("map").await.unwrap();
        assert!(!report.is_complete());
        assert!(report.acknowledged.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed[0].1.contains("timed out"));
        assert!(coordinator.pending().is_empty());

        let report = coordinator.trigger_modification("source", "map").await.unwrap();
        assert_eq!(report.failed.len(), 2);
        assert!(!coordinator.pending().contains(report.modification_id));
        assert_eq!(graph.status(), JobStatus::Running);
    }

    #[tokio::test]
    async fn overdue_modifications_expire() {
        let h = deployed(&pipeline(), 8).await;
        let target = attempts_of(&h.coordinator, "map")[0].attempt_id();
        let id = h
            .coordinator
            .pending()
            .begin(ModificationKind::Trigger, 0, [target], Duration::ZERO);

        let expired = h.coordinator.expire_overdue();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), id);
        assert!(h.coordinator.pending().is_empty());
        h.shutdown().await;
    }

    #[tokio::test]
    async fn run_loop_feeds_responses_until_shutdown() {
        let h = deployed(&pipeline(), 8).await;
        let job_id = h.coordinator.graph().job_id();
        let target = attempts_of(&h.coordinator, "map")[0].attempt_id();
        let id = h.coordinator.pending().begin(
            ModificationKind::Trigger,
            0,
            [target],
            Duration::from_secs(60),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = h.coordinator.clone();
        let handle = tokio::spawn(async move { coordinator.run(rx, shutdown_rx).await });

        tx.send(ModificationResponse::Acknowledge(AcknowledgeModification {
            job_id,
            attempt_id: target,
            modification_id: id,
        }))
        .unwrap();
        let deadline = Instant::now() + TIMEOUT;
        while h.coordinator.pending().contains(id) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!h.coordinator.pending().contains(id));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap();
        h.shutdown().await;
    }

    #[tokio::test]
    async fn execute_dispatches_commands() {
        let h = deployed(&pipeline(), 8).await;
        h.coordinator.record_new_operator_resources([]);

        let outcome = h
            .coordinator
            .execute(&ModifyOptions::new("describe", vec![]))
            .await
            .unwrap();
        let ModifyOutcome::Plan { plan } = &outcome else {
            panic!("expected a plan, got {outcome:?}");
        };
        assert!(plan.contains("Vertex Map"));
        assert!(plan.contains("ExecutionJobVertex(Map |"));
        assert!(plan.contains("status RUNNING"));

        let outcome = h
            .coordinator
            .execute(&ModifyOptions::new("pause", vec!["map".into()]))
            .await
            .unwrap();
        assert!(matches!(outcome, ModifyOutcome::Control(ref r) if r.kind == ModificationKind::Pause));
        assert!(outcome.to_string().starts_with("pause "));

        let outcome = h
            .coordinator
            .execute(&ModifyOptions::new("restart", vec!["source".into()]))
            .await
            .unwrap();
        assert!(matches!(outcome, ModifyOutcome::Restarted(ref r) if r.attempts.len() == 2));
        assert!(outcome.to_string().starts_with("restarted "));

        let err = h
            .coordinator
            .execute(&ModifyOptions::new("grow", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ModifyError::MissingArgument { command: "grow", .. }));
        h.shutdown().await;
    }
}
