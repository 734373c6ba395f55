//! In-process worker: runs deployed attempts and answers control calls.
//!
//! `LocalTaskExecutor` implements `TaskGateway` for attempts running in
//! this process. Each deployed attempt gets its own run loop task with a
//! shutdown signal, a pause signal, and a control channel for injected
//! events. Result partitions are shared through a table keyed by
//! partition id, so consumers deployed at any time attach to live
//! producers.
//!
//! Attempts whose run loop ended are dropped from the task table the
//! next time a control call names them; the call is declined.
//!
//! The executor assumes it is the job's only worker: modification
//! markers name the target attempts hosted here, so targets on other
//! workers would never be resumed by the marker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flow_core::{BlobKey, BlobSet, ExecutionAttemptId, JobVertexId, ModificationId, PartitionId};
use flowgrid_graph::{GatewayError, GatewayFuture, ModificationResponse, TaskDeploymentDescriptor, TaskGateway};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::ChannelEvent;
use crate::marker::ModificationMarker;
use crate::operator::OperatorRegistry;
use crate::partition::{ChannelWriter, ResultPartition};
use crate::pause::PauseSignal;
use crate::run_loop::{RunLoop, RunState};

const DEFAULT_SOURCE_INTERVAL: Duration = Duration::from_millis(10);

// ── Blob cache ──────────────────────────────────────────────────────

/// Content-addressed store of operator code and resources.
#[derive(Debug, Default)]
pub struct BlobCache {
    blobs: Mutex<HashMap<BlobKey, Vec<u8>>>,
}

impl BlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bytes: &[u8]) -> BlobKey {
        let key = BlobKey::for_content(bytes);
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| bytes.to_vec());
        key
    }

    pub fn contains(&self, key: &BlobKey) -> bool {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Keys of `required` that are not cached.
    pub fn missing(&self, required: &BlobSet) -> Vec<BlobKey> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        required
            .iter()
            .filter(|k| !blobs.contains_key(k))
            .copied()
            .collect()
    }
}

// ── Executor ────────────────────────────────────────────────────────

/// A running attempt.
struct TaskSlot {
    vertex_id: JobVertexId,
    task_name: String,
    pause: Arc<PauseSignal>,
    control: mpsc::UnboundedSender<ChannelEvent>,
    state: watch::Receiver<RunState>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<RunState>,
}

pub struct LocalTaskExecutor {
    location: String,
    registry: OperatorRegistry,
    blobs: BlobCache,
    partitions: Mutex<HashMap<PartitionId, Arc<ResultPartition>>>,
    tasks: Mutex<HashMap<ExecutionAttemptId, TaskSlot>>,
    responses: mpsc::UnboundedSender<ModificationResponse>,
    source_interval: Duration,
}

impl LocalTaskExecutor {
    /// Create an executor whose run loops report modification responses
    /// on `responses`.
    pub fn new(
        location: &str,
        registry: OperatorRegistry,
        responses: mpsc::UnboundedSender<ModificationResponse>,
    ) -> Self {
        Self {
            location: location.to_string(),
            registry,
            blobs: BlobCache::new(),
            partitions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            responses,
            source_interval: DEFAULT_SOURCE_INTERVAL,
        }
    }

    pub fn with_source_interval(mut self, interval: Duration) -> Self {
        self.source_interval = interval;
        self
    }

    pub fn blobs(&self) -> &BlobCache {
        &self.blobs
    }

    pub fn upload_blob(&self, bytes: &[u8]) -> BlobKey {
        let key = self.blobs.put(bytes);
        debug!(location = %self.location, blob = ?key, "blob cached");
        key
    }

    pub fn run_state(&self, attempt: ExecutionAttemptId) -> Option<RunState> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.get(&attempt).map(|t| *t.state.borrow())
    }

    /// Attempts whose run loop has not ended.
    pub fn running_attempts(&self) -> Vec<ExecutionAttemptId> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = tasks
            .iter()
            .filter(|(_, t)| !t.state.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Wait until `attempt` reaches `state`, up to `timeout`.
    pub async fn wait_for_state(
        &self,
        attempt: ExecutionAttemptId,
        state: RunState,
        timeout: Duration,
    ) -> bool {
        let rx = {
            let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.get(&attempt).map(|t| t.state.clone())
        };
        let Some(mut rx) = rx else {
            return false;
        };
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await,
            Ok(Ok(_))
        )
    }

    /// Stop every run loop.
    pub async fn shutdown(&self) {
        let slots: Vec<(ExecutionAttemptId, TaskSlot)> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain().collect()
        };
        for (attempt, slot) in slots {
            let _ = slot.shutdown_tx.send(true);
            if let Err(e) = slot.handle.await {
                warn!(%attempt, error = %e, "run loop task ended abnormally");
            }
        }
        info!(location = %self.location, "local executor stopped");
    }

    fn partition(&self, id: PartitionId) -> Arc<ResultPartition> {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            partitions
                .entry(id)
                .or_insert_with(|| Arc::new(ResultPartition::new(id))),
        )
    }

    fn deploy(&self, descriptor: TaskDeploymentDescriptor) -> Result<(), GatewayError> {
        let attempt = descriptor.attempt_id;
        if self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&attempt)
        {
            return Err(GatewayError::Declined(format!("attempt {attempt} is already running")));
        }

        let missing = self.blobs.missing(&descriptor.blob_keys);
        if !missing.is_empty() {
            warn!(%attempt, missing = missing.len(), "declining deployment with unknown blobs");
            return Err(GatewayError::MissingBlobs(missing));
        }
        let operator = self
            .registry
            .instantiate(&descriptor)
            .ok_or_else(|| GatewayError::UnknownInvokable(descriptor.invokable.clone()))?;

        let outputs: Vec<Arc<ResultPartition>> = descriptor
            .produced_partitions
            .iter()
            .map(|(_, partition)| self.partition(*partition))
            .collect();

        let mut run_loop = RunLoop::new(descriptor.job_id, attempt, &descriptor.task_name, operator)
            .with_outputs(outputs)
            .with_responses(self.responses.clone())
            .with_source_interval(self.source_interval);

        if !descriptor.input_gates.is_empty() {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut channel = 0;
            for gate in &descriptor.input_gates {
                for partition in &gate.partitions {
                    self.partition(*partition)
                        .subscribe(gate.consumer_index, ChannelWriter::new(channel, tx.clone()));
                    channel += 1;
                }
            }
            run_loop = run_loop.with_input(rx);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slot = TaskSlot {
            vertex_id: descriptor.vertex_id,
            task_name: descriptor.task_name.clone(),
            pause: run_loop.pause_signal(),
            control: run_loop.control_sender(),
            state: run_loop.subscribe_state(),
            shutdown_tx,
            handle: tokio::spawn(run_loop.run(shutdown_rx)),
        };
        info!(
            %attempt,
            task = %descriptor.task_name,
            location = %self.location,
            inputs = descriptor.input_gates.len(),
            "task started"
        );
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(attempt, slot);
        Ok(())
    }

    /// Run `f` on a live task. A task whose loop ended is removed and the
    /// call declined.
    fn with_task<T>(
        &self,
        attempt: ExecutionAttemptId,
        f: impl FnOnce(&TaskSlot) -> T,
    ) -> Result<T, GatewayError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let state = tasks
            .get(&attempt)
            .map(|t| *t.state.borrow())
            .ok_or(GatewayError::UnknownAttempt(attempt))?;
        if state.is_terminal() {
            tasks.remove(&attempt);
            debug!(%attempt, %state, "dropped ended task");
            return Err(GatewayError::Declined(format!("attempt {attempt} is {state}")));
        }
        tasks
            .get(&attempt)
            .map(f)
            .ok_or(GatewayError::UnknownAttempt(attempt))
    }

    /// Live attempts of the given vertices hosted by this executor.
    fn attempts_of(&self, vertices: &[JobVertexId]) -> Vec<ExecutionAttemptId> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks
            .iter()
            .filter(|(_, t)| vertices.contains(&t.vertex_id) && !t.state.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }
}

impl TaskGateway for LocalTaskExecutor {
    fn location(&self) -> &str {
        &self.location
    }

    fn submit_task(&self, descriptor: TaskDeploymentDescriptor) -> GatewayFuture<'_, ()> {
        let result = self.deploy(descriptor);
        Box::pin(async move { result })
    }

    fn cancel_task(&self, attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()> {
        let slot = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&attempt);
        Box::pin(async move {
            let slot = slot.ok_or(GatewayError::UnknownAttempt(attempt))?;
            let _ = slot.shutdown_tx.send(true);
            match slot.handle.await {
                Ok(state) => debug!(%attempt, task = %slot.task_name, %state, "task canceled"),
                Err(e) => warn!(%attempt, error = %e, "run loop task ended abnormally"),
            }
            Ok(())
        })
    }

    fn pause_task(&self, attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()> {
        let result = self.with_task(attempt, |t| {
            debug!(%attempt, task = %t.task_name, "pause requested");
            t.pause.pause();
        });
        Box::pin(async move { result })
    }

    fn resume_task(&self, attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()> {
        let result = self.with_task(attempt, |t| {
            debug!(%attempt, task = %t.task_name, "resume requested");
            t.pause.resume();
        });
        Box::pin(async move { result })
    }

    fn trigger_modification(
        &self,
        attempt: ExecutionAttemptId,
        modification: ModificationId,
        timestamp: u64,
        target_vertices: Vec<JobVertexId>,
    ) -> GatewayFuture<'_, ()> {
        // Single worker: the attempts hosted here are all the targets.
        let targets = self.attempts_of(&target_vertices);
        let marker = ModificationMarker::new(modification, timestamp, targets);
        let result = self.with_task(attempt, |t| {
            info!(%attempt, task = %t.task_name, %marker, "injecting modification marker");
            t.control
                .send(ChannelEvent::Modification(marker))
                .map_err(|_| GatewayError::Declined(format!("attempt {attempt} is no longer running")))
        });
        Box::pin(async move { result.and_then(|sent| sent) })
    }
}

#[cfg(test)]
mod tests {
    use flow_core::{IntermediateDataSetId, JobId};
    use flowgrid_graph::{ExecutionState, InputGateDescriptor};
    use serde_json::{Value, json};

    use super::*;
    use crate::error::TaskResult;
    use crate::operator::{Invokable, ONE_INPUT_TASK, SOURCE_TASK};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn executor() -> (LocalTaskExecutor, mpsc::UnboundedReceiver<ModificationResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let exec = LocalTaskExecutor::new("local-0", OperatorRegistry::with_defaults(), tx)
            .with_source_interval(Duration::from_millis(1));
        (exec, rx)
    }

    fn descriptor(
        vertex: u64,
        attempt: u64,
        invokable: &str,
        produced: Option<PartitionId>,
        inputs: Vec<PartitionId>,
    ) -> TaskDeploymentDescriptor {
        TaskDeploymentDescriptor {
            job_id: JobId::from_raw(1),
            vertex_id: JobVertexId::from_raw(vertex),
            attempt_id: ExecutionAttemptId::from_raw(attempt),
            task_name: format!("task-{attempt}"),
            subtask_index: 0,
            parallelism: 1,
            invokable: invokable.to_string(),
            produced_partitions: produced
                .map(|p| vec![(IntermediateDataSetId::from_raw(vertex), p)])
                .unwrap_or_default(),
            input_gates: if inputs.is_empty() {
                vec![]
            } else {
                vec![InputGateDescriptor {
                    result_id: IntermediateDataSetId::from_raw(1),
                    consumer_index: 0,
                    partitions: inputs,
                }]
            },
            blob_keys: BlobSet::new(),
        }
    }

    #[test]
    fn blob_cache_reports_missing_keys() {
        let cache = BlobCache::new();
        let known = cache.put(b"operator code");
        let unknown = BlobKey::for_content(b"other");
        assert!(cache.contains(&known));
        let required: BlobSet = [known, unknown].into_iter().collect();
        assert_eq!(cache.missing(&required), vec![unknown]);
    }

    #[tokio::test]
    async fn deployment_with_unknown_blob_is_declined() {
        let (exec, _rx) = executor();
        let mut tdd = descriptor(1, 1, SOURCE_TASK, None, vec![]);
        tdd.blob_keys.insert(BlobKey::for_content(b"missing"));

        let err = exec.submit_task(tdd.clone()).await.unwrap_err();
        assert!(matches!(err, GatewayError::MissingBlobs(ref keys) if keys.len() == 1));

        exec.upload_blob(b"missing");
        exec.submit_task(tdd).await.unwrap();
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_invokable_is_declined() {
        let (exec, _rx) = executor();
        let err = exec
            .submit_task(descriptor(1, 1, "com.example.Missing", None, vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::UnknownInvokable("com.example.Missing".to_string()));
    }

    #[tokio::test]
    async fn control_of_unknown_attempt_fails() {
        let (exec, _rx) = executor();
        let attempt = ExecutionAttemptId::from_raw(99);
        assert_eq!(exec.pause_task(attempt).await.unwrap_err(), GatewayError::UnknownAttempt(attempt));
        assert_eq!(exec.cancel_task(attempt).await.unwrap_err(), GatewayError::UnknownAttempt(attempt));
    }

    #[tokio::test]
    async fn pause_and_resume_reach_the_run_loop() {
        let (exec, _rx) = executor();
        let partition = PartitionId::from_raw(10);
        let source = ExecutionAttemptId::from_raw(1);
        let map = ExecutionAttemptId::from_raw(2);
        exec.submit_task(descriptor(1, 1, SOURCE_TASK, Some(partition), vec![]))
            .await
            .unwrap();
        exec.submit_task(descriptor(2, 2, ONE_INPUT_TASK, None, vec![partition]))
            .await
            .unwrap();

        exec.pause_task(map).await.unwrap();
        assert!(exec.wait_for_state(map, RunState::PausedForModification, TIMEOUT).await);
        assert_eq!(exec.run_state(source), Some(RunState::Running));

        exec.resume_task(map).await.unwrap();
        assert!(exec.wait_for_state(map, RunState::Running, TIMEOUT).await);

        exec.cancel_task(map).await.unwrap();
        assert_eq!(exec.running_attempts(), vec![source]);
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_resumes_paused_target_and_acknowledges() {
        let (exec, mut rx) = executor();
        let partition = PartitionId::from_raw(20);
        let source = ExecutionAttemptId::from_raw(11);
        let map = ExecutionAttemptId::from_raw(12);
        exec.submit_task(descriptor(1, 11, SOURCE_TASK, Some(partition), vec![]))
            .await
            .unwrap();
        exec.submit_task(descriptor(2, 12, ONE_INPUT_TASK, None, vec![partition]))
            .await
            .unwrap();

        exec.pause_task(map).await.unwrap();
        assert!(exec.wait_for_state(map, RunState::PausedForModification, TIMEOUT).await);

        exec.trigger_modification(source, ModificationId::from_raw(3), 100, vec![JobVertexId::from_raw(2)])
            .await
            .unwrap();

        assert!(exec.wait_for_state(map, RunState::Running, TIMEOUT).await);
        let response = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        let ModificationResponse::Acknowledge(ack) = response else {
            panic!("expected acknowledgement, got {response:?}");
        };
        assert_eq!(ack.attempt_id, map);
        assert_eq!(ack.modification_id, ModificationId::from_raw(3));
        exec.shutdown().await;
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

    #[tokio::test]
    async fn ended_tasks_report_state_and_decline_control() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = OperatorRegistry::with_defaults();
        registry.register("test.Bounded", |_| Box::new(Bounded(3)));
        let exec = LocalTaskExecutor::new("local-0", registry, tx).with_source_interval(Duration::from_millis(1));
        let partition = PartitionId::from_raw(30);
        let map = ExecutionAttemptId::from_raw(22);
        exec.submit_task(descriptor(2, 22, ONE_INPUT_TASK, None, vec![partition]))
            .await
            .unwrap();
        exec.submit_task(descriptor(1, 21, "test.Bounded", Some(partition), vec![]))
            .await
            .unwrap();

        let mut ended = Vec::new();
        while ended.len() < 2 {
            let response = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
            let ModificationResponse::TaskState(update) = response else {
                panic!("expected a task state update, got {response:?}");
            };
            assert_eq!(update.state, ExecutionState::Finished);
            ended.push(update.attempt_id);
        }
        ended.sort();
        assert_eq!(ended, vec![ExecutionAttemptId::from_raw(21), map]);
        assert!(exec.running_attempts().is_empty());

        assert!(matches!(exec.pause_task(map).await.unwrap_err(), GatewayError::Declined(_)));
        assert_eq!(exec.resume_task(map).await.unwrap_err(), GatewayError::UnknownAttempt(map));
        exec.shutdown().await;
    }
}
