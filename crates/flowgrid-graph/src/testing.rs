//! Scripted gateway used by the graph crate's unit tests.

use std::sync::Mutex;

use flow_core::{ExecutionAttemptId, JobVertexId, ModificationId};

use crate::gateway::{GatewayError, GatewayFuture, TaskDeploymentDescriptor, TaskGateway};

#[derive(Clone)]
enum Behavior {
    Ack,
    Hang,
    Fail(String),
}

pub(crate) struct ScriptedGateway {
    location: String,
    behavior: Behavior,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub(crate) fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            behavior: Behavior::Ack,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn hanging(mut self) -> Self {
        self.behavior = Behavior::Hang;
        self
    }

    pub(crate) fn failing(mut self, reason: &str) -> Self {
        self.behavior = Behavior::Fail(reason.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(&self, call: String) -> GatewayFuture<'_, ()> {
        self.calls.lock().unwrap().push(call);
        let behavior = self.behavior.clone();
        Box::pin(async move {
            match behavior {
                Behavior::Ack => Ok(()),
                Behavior::Hang => std::future::pending().await,
                Behavior::Fail(reason) => Err(GatewayError::Unreachable(reason)),
            }
        })
    }
}

impl TaskGateway for ScriptedGateway {
    fn location(&self) -> &str {
        &self.location
    }

    fn submit_task(&self, descriptor: TaskDeploymentDescriptor) -> GatewayFuture<'_, ()> {
        self.respond(format!("submit {}", descriptor.attempt_id))
    }

    fn cancel_task(&self, attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()> {
        self.respond(format!("cancel {attempt}"))
    }

    fn pause_task(&self, attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()> {
        self.respond(format!("pause {attempt}"))
    }

    fn resume_task(&self, attempt: ExecutionAttemptId) -> GatewayFuture<'_, ()> {
        self.respond(format!("resume {attempt}"))
    }

    fn trigger_modification(
        &self,
        attempt: ExecutionAttemptId,
        modification: ModificationId,
        _timestamp: u64,
        _target_vertices: Vec<JobVertexId>,
    ) -> GatewayFuture<'_, ()> {
        self.respond(format!("trigger {attempt} {modification}"))
    }
}
