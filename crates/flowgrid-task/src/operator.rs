//! Operator implementations and the registry that resolves invokable names.

use std::collections::HashMap;
use std::sync::Arc;

use flowgrid_graph::TaskDeploymentDescriptor;
use serde_json::{Value, json};

use crate::error::TaskResult;

pub const SOURCE_TASK: &str = "flowgrid.SourceTask";
pub const ONE_INPUT_TASK: &str = "flowgrid.OneInputTask";
pub const SINK_TASK: &str = "flowgrid.SinkTask";

/// The user code a run loop drives.
pub trait Invokable: Send {
    /// Sources produce records without input.
    fn is_source(&self) -> bool {
        false
    }

    /// Next record of a source; `None` once exhausted.
    fn next_record(&mut self) -> Option<Value> {
        None
    }

    /// Handle one input record, returning the records to emit.
    fn process(&mut self, record: Value) -> TaskResult<Vec<Value>>;
}

pub type OperatorFactory = Arc<dyn Fn(&TaskDeploymentDescriptor) -> Box<dyn Invokable> + Send + Sync>;

/// Maps invokable names to operator factories.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in source, forwarding, and sink operators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SOURCE_TASK, |tdd| {
            Box::new(SequenceSource::new(tdd.subtask_index as u64, tdd.parallelism.max(1) as u64))
        });
        registry.register(ONE_INPUT_TASK, |_| Box::new(Forward));
        registry.register(SINK_TASK, |_| Box::new(Discard));
        registry
    }

    pub fn register<F>(&mut self, invokable: &str, factory: F)
    where
        F: Fn(&TaskDeploymentDescriptor) -> Box<dyn Invokable> + Send + Sync + 'static,
    {
        self.factories.insert(invokable.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, invokable: &str) -> bool {
        self.factories.contains_key(invokable)
    }

    pub fn instantiate(&self, descriptor: &TaskDeploymentDescriptor) -> Option<Box<dyn Invokable>> {
        self.factories
            .get(&descriptor.invokable)
            .map(|factory| factory(descriptor))
    }
}

/// Unbounded source emitting `subtask, subtask + parallelism, ...`.
pub struct SequenceSource {
    next: u64,
    step: u64,
}

impl SequenceSource {
    pub fn new(start: u64, step: u64) -> Self {
        Self { next: start, step }
    }
}

impl Invokable for SequenceSource {
    fn is_source(&self) -> bool {
        true
    }

    fn next_record(&mut self) -> Option<Value> {
        let value = self.next;
        self.next = self.next.checked_add(self.step)?;
        Some(json!(value))
    }

    fn process(&mut self, record: Value) -> TaskResult<Vec<Value>> {
        Ok(vec![record])
    }
}

struct Forward;

impl Invokable for Forward {
    fn process(&mut self, record: Value) -> TaskResult<Vec<Value>> {
        Ok(vec![record])
    }
}

struct Discard;

impl Invokable for Discard {
    fn process(&mut self, _record: Value) -> TaskResult<Vec<Value>> {
        Ok(Vec::new())
    }
}
