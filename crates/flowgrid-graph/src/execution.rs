//! One execution attempt of a task replica.
//!
//! The attempt is the handle the coordinator uses to control a replica on
//! its worker. Control calls are fire-and-await: each is bounded by the
//! caller's timeout, a timeout is reported as a failure of that call, and
//! the attempt itself never retries.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flow_core::{ExecutionAttemptId, JobVertexId, ModificationId};
use tracing::{debug, info, warn};

use crate::error::{GraphError, GraphResult};
use crate::gateway::{GatewayError, TaskDeploymentDescriptor, TaskGateway};
use crate::slot::Slot;
use crate::state::ExecutionState;

#[derive(Debug)]
pub struct Execution {
    attempt_id: ExecutionAttemptId,
    vertex_id: JobVertexId,
    task_name: String,
    subtask_index: usize,
    attempt_number: u32,
    invokable: String,
    created_at: u64,
    state: Mutex<ExecutionState>,
    assigned: Mutex<Option<Slot>>,
}

impl Execution {
    pub fn new(
        vertex_id: JobVertexId,
        task_name: &str,
        subtask_index: usize,
        attempt_number: u32,
        invokable: &str,
    ) -> Self {
        Self::with_attempt_id(
            ExecutionAttemptId::generate(),
            vertex_id,
            task_name,
            subtask_index,
            attempt_number,
            invokable,
        )
    }

    pub fn with_attempt_id(
        attempt_id: ExecutionAttemptId,
        vertex_id: JobVertexId,
        task_name: &str,
        subtask_index: usize,
        attempt_number: u32,
        invokable: &str,
    ) -> Self {
        Self {
            attempt_id,
            vertex_id,
            task_name: task_name.to_string(),
            subtask_index,
            attempt_number,
            invokable: invokable.to_string(),
            created_at: epoch_millis(),
            state: Mutex::new(ExecutionState::Created),
            assigned: Mutex::new(None),
        }
    }

    pub fn attempt_id(&self) -> ExecutionAttemptId {
        self.attempt_id
    }

    pub fn vertex_id(&self) -> JobVertexId {
        self.vertex_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn subtask_index(&self) -> usize {
        self.subtask_index
    }

    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub fn invokable(&self) -> &str {
        &self.invokable
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// `"Map (2/4) - attempt #0"`
    pub fn vertex_with_attempt(&self) -> String {
        format!("{} - attempt #{}", self.task_name, self.attempt_number)
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move from `from` to `to`; returns false if the attempt was not in
    /// `from`.
    pub fn transition_state(&self, from: ExecutionState, to: ExecutionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return false;
        }
        *state = to;
        debug!(attempt = %self.attempt_id, %from, %to, "attempt state changed");
        true
    }

    /// Force a state, used for terminal transitions.
    pub fn mark(&self, to: ExecutionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(attempt = %self.attempt_id, from = %*state, %to, "attempt state forced");
        *state = to;
    }

    pub fn assigned_slot(&self) -> Option<Slot> {
        self.assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn assigned_location(&self) -> Option<String> {
        self.assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.location().to_string())
    }

    /// Bind a freshly allocated slot. Only a created attempt accepts one.
    pub fn assign_slot(&self, slot: Slot) -> GraphResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ExecutionState::Created {
            return Err(GraphError::IllegalState {
                attempt: self.attempt_id,
                state: *state,
                operation: "assign a slot to",
            });
        }
        *self.assigned.lock().unwrap_or_else(PoisonError::into_inner) = Some(slot);
        *state = ExecutionState::Scheduled;
        Ok(())
    }

    /// Drop the slot binding, returning the slot for release.
    pub fn take_slot(&self) -> Option<Slot> {
        self.assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn gateway(&self) -> GraphResult<Arc<dyn TaskGateway>> {
        self.assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Slot::gateway)
            .ok_or(GraphError::NotDeployed(self.attempt_id))
    }

    async fn call<F>(&self, operation: &'static str, timeout: Duration, call: F) -> GraphResult<()>
    where
        F: Future<Output = Result<(), GatewayError>>,
    {
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => {
                warn!(attempt = %self.attempt_id, operation, error = %source, "control call failed");
                Err(GraphError::Gateway {
                    attempt: self.attempt_id,
                    operation,
                    source,
                })
            }
            Err(_) => {
                warn!(attempt = %self.attempt_id, operation, ?timeout, "control call timed out");
                Err(GraphError::ControlTimeout {
                    attempt: self.attempt_id,
                    operation,
                    timeout,
                })
            }
        }
    }

    /// Hand the attempt to the worker behind its slot.
    pub async fn deploy(
        &self,
        descriptor: TaskDeploymentDescriptor,
        timeout: Duration,
    ) -> GraphResult<()> {
        if !self.transition_state(ExecutionState::Scheduled, ExecutionState::Deploying) {
            return Err(GraphError::IllegalState {
                attempt: self.attempt_id,
                state: self.state(),
                operation: "deploy",
            });
        }
        let gateway = self.gateway()?;
        match self
            .call("submit", timeout, gateway.submit_task(descriptor))
            .await
        {
            Ok(()) => {
                self.transition_state(ExecutionState::Deploying, ExecutionState::Running);
                info!(
                    attempt = %self.attempt_id,
                    task = %self.vertex_with_attempt(),
                    location = gateway.location(),
                    "attempt deployed"
                );
                Ok(())
            }
            Err(e) => {
                self.mark(ExecutionState::Failed);
                Err(e)
            }
        }
    }

    pub async fn pause(&self, timeout: Duration) -> GraphResult<()> {
        self.require_active("pause")?;
        let gateway = self.gateway()?;
        self.call("pause", timeout, gateway.pause_task(self.attempt_id))
            .await?;
        self.transition_state(ExecutionState::Running, ExecutionState::Paused);
        Ok(())
    }

    pub async fn resume(&self, timeout: Duration) -> GraphResult<()> {
        self.require_active("resume")?;
        let gateway = self.gateway()?;
        self.call("resume", timeout, gateway.resume_task(self.attempt_id))
            .await?;
        self.transition_state(ExecutionState::Paused, ExecutionState::Running);
        Ok(())
    }

    pub async fn trigger_modification(
        &self,
        modification: ModificationId,
        timestamp: u64,
        target_vertices: Vec<JobVertexId>,
        timeout: Duration,
    ) -> GraphResult<()> {
        self.require_active("trigger a modification on")?;
        let gateway = self.gateway()?;
        self.call(
            "trigger modification",
            timeout,
            gateway.trigger_modification(self.attempt_id, modification, timestamp, target_vertices),
        )
        .await
    }

    pub async fn cancel(&self, timeout: Duration) -> GraphResult<()> {
        let current = self.state();
        if current.is_terminal() {
            return Ok(());
        }
        self.mark(ExecutionState::Canceling);
        let result = match self.gateway() {
            Ok(gateway) => {
                self.call("cancel", timeout, gateway.cancel_task(self.attempt_id))
                    .await
            }
            // Never deployed: nothing to stop remotely.
            Err(_) => Ok(()),
        };
        self.mark(ExecutionState::Canceled);
        result
    }

    /// Record that the worker observed the attempt paused or resumed on
    /// its own, e.g. after a modification marker.
    pub fn mark_resumed(&self) -> bool {
        self.transition_state(ExecutionState::Paused, ExecutionState::Running)
    }

    fn require_active(&self, operation: &'static str) -> GraphResult<()> {
        let state = self.state();
        if !state.is_active() {
            return Err(GraphError::IllegalState {
                attempt: self.attempt_id,
                state,
                operation,
            });
        }
        Ok(())
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
