//! Slot allocation for execution attempts.
//!
//! A `Slot` is a unit of capacity on one worker, carrying the gateway used
//! to control whatever runs in it. `SlotPool` is the in-process provider:
//! a fixed number of slots per registered worker, preferring the locations
//! named in the request.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use flow_core::{ExecutionAttemptId, JobVertexId};
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};
use crate::gateway::TaskGateway;

#[derive(Clone)]
pub struct Slot {
    id: u64,
    location: String,
    gateway: Arc<dyn TaskGateway>,
}

impl Slot {
    pub fn new(id: u64, gateway: Arc<dyn TaskGateway>) -> Self {
        Self {
            id,
            location: gateway.location().to_string(),
            gateway,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn gateway(&self) -> Arc<dyn TaskGateway> {
        Arc::clone(&self.gateway)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("location", &self.location)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub attempt_id: ExecutionAttemptId,
    pub vertex_id: JobVertexId,
    pub task_name: String,
    pub subtask_index: usize,
    /// Locations to favor, e.g. where upstream attempts already run.
    pub preferred_locations: Vec<String>,
}

pub trait SlotProvider: Send + Sync {
    fn allocate_slot(&self, request: &SlotRequest) -> GraphResult<Slot>;

    fn release_slot(&self, slot: &Slot);
}

struct WorkerSlots {
    gateway: Arc<dyn TaskGateway>,
    total: u32,
    free: u32,
}

/// Fixed-capacity slot provider over a set of workers.
pub struct SlotPool {
    workers: Mutex<Vec<WorkerSlots>>,
    next_slot_id: AtomicU64,
}

impl SlotPool {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            next_slot_id: AtomicU64::new(1),
        }
    }

    /// Offer `slots` slots on the worker behind `gateway`.
    pub fn register_worker(&self, gateway: Arc<dyn TaskGateway>, slots: u32) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(location = gateway.location(), slots, "worker registered with slot pool");
        workers.push(WorkerSlots {
            gateway,
            total: slots,
            free: slots,
        });
    }

    pub fn available_slots(&self) -> u32 {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.iter().map(|w| w.free).sum()
    }
}

impl Default for SlotPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotProvider for SlotPool {
    fn allocate_slot(&self, request: &SlotRequest) -> GraphResult<Slot> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let preferred = workers.iter().position(|w| {
            w.free > 0
                && request
                    .preferred_locations
                    .iter()
                    .any(|loc| loc == w.gateway.location())
        });
        let chosen = preferred.or_else(|| {
            workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.free > 0)
                .max_by_key(|(_, w)| w.free)
                .map(|(i, _)| i)
        });

        let Some(idx) = chosen else {
            return Err(GraphError::NoResourceAvailable {
                vertex: request.task_name.clone(),
                subtask: request.subtask_index,
            });
        };

        let worker = &mut workers[idx];
        worker.free -= 1;
        let slot = Slot::new(
            self.next_slot_id.fetch_add(1, Ordering::Relaxed),
            Arc::clone(&worker.gateway),
        );
        debug!(
            attempt = %request.attempt_id,
            location = slot.location(),
            co_located = preferred.is_some(),
            "slot allocated"
        );
        Ok(slot)
    }

    fn release_slot(&self, slot: &Slot) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        match workers
            .iter_mut()
            .find(|w| w.gateway.location() == slot.location())
        {
            Some(w) if w.free < w.total => {
                w.free += 1;
                debug!(slot = slot.id(), location = slot.location(), "slot released");
            }
            _ => warn!(slot = slot.id(), location = slot.location(), "released unknown slot"),
        }
    }
}
