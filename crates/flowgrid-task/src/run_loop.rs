//! The per-attempt run loop.
//!
//! ```text
//!            ┌────────────── pause flag set ──────────────┐
//!            │                                            ▼
//!   RUNNING ─┤ one unit of work per iteration      PAUSED_FOR_MODIFICATION
//!            │ (record, event, or source emit)       buffers input in order,
//!            ▲                                        forwards markers
//!            └──── resume() or marker naming this attempt ┘
//! ```
//!
//! The pause flag is checked once per outer iteration. Pauses are
//! unaligned: channels are not synchronized, so per-channel progress may
//! be skewed while paused. A paused loop keeps its input channels and
//! buffers; on resume the buffered elements are handled first, in arrival
//! order.
//!
//! Modification markers are not buffered. A marker that arrives while
//! paused is acknowledged (if it names this attempt) and forwarded
//! downstream at once, ahead of any records buffered before it. Markers
//! therefore do not keep their position relative to data across a pause.
//!
//! A loop that ends on its own (input exhausted or operator error)
//! finishes its output partitions and reports `Finished` or `Failed` on
//! the response channel. A stopped loop leaves its partitions open for a
//! successor attempt.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use flow_core::{ExecutionAttemptId, JobId};
use flowgrid_graph::{AcknowledgeModification, ExecutionState, ModificationResponse, TaskStateUpdate};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::error::TaskResult;
use crate::event::{self, ChannelEvent, TaskEvent};
use crate::marker::ModificationMarker;
use crate::operator::Invokable;
use crate::partition::{InputElement, InputReceiver, ResultPartition, WireElement};
use crate::pause::PauseSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Voluntarily paused; input is retained and the loop can resume.
    PausedForModification,
    Finished,
    /// Canceled from outside.
    Stopped,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Finished | RunState::Stopped | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Running => "running",
            RunState::PausedForModification => "paused for modification",
            RunState::Finished => "finished",
            RunState::Stopped => "stopped",
            RunState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of one select round.
enum Step {
    Recheck,
    Stop,
    Control(ChannelEvent),
    Input(Option<InputElement>),
}

pub struct RunLoop {
    job_id: JobId,
    attempt_id: ExecutionAttemptId,
    task_name: String,
    operator: Box<dyn Invokable>,
    input: Option<InputReceiver>,
    outputs: Vec<Arc<ResultPartition>>,
    /// Events injected by the worker, e.g. a marker on a source.
    control: mpsc::UnboundedReceiver<ChannelEvent>,
    control_tx: mpsc::UnboundedSender<ChannelEvent>,
    pause: Arc<PauseSignal>,
    responses: Option<mpsc::UnboundedSender<ModificationResponse>>,
    state_tx: watch::Sender<RunState>,
    buffered: VecDeque<InputElement>,
    source_interval: Duration,
}

impl RunLoop {
    pub fn new(
        job_id: JobId,
        attempt_id: ExecutionAttemptId,
        task_name: &str,
        operator: Box<dyn Invokable>,
    ) -> Self {
        let (control_tx, control) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(RunState::Running);
        Self {
            job_id,
            attempt_id,
            task_name: task_name.to_string(),
            operator,
            input: None,
            outputs: Vec::new(),
            control,
            control_tx,
            pause: Arc::new(PauseSignal::new()),
            responses: None,
            state_tx,
            buffered: VecDeque::new(),
            source_interval: Duration::ZERO,
        }
    }

    pub fn with_input(mut self, input: InputReceiver) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<Arc<ResultPartition>>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_responses(mut self, responses: mpsc::UnboundedSender<ModificationResponse>) -> Self {
        self.responses = Some(responses);
        self
    }

    /// Delay between two source records.
    pub fn with_source_interval(mut self, interval: Duration) -> Self {
        self.source_interval = interval;
        self
    }

    pub fn pause_signal(&self) -> Arc<PauseSignal> {
        Arc::clone(&self.pause)
    }

    /// Sender for events the loop broadcasts on its outputs.
    pub fn control_sender(&self) -> mpsc::UnboundedSender<ChannelEvent> {
        self.control_tx.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    /// Drive the operator until input ends, `shutdown` flips, or an error
    /// occurs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RunState {
        info!(attempt = %self.attempt_id, task = %self.task_name, "run loop started");
        let exit = match self.run_inner(&mut shutdown).await {
            Ok(state) => state,
            Err(e) => {
                error!(attempt = %self.attempt_id, task = %self.task_name, error = %e, "run loop failed");
                RunState::Failed
            }
        };
        let reported = match exit {
            RunState::Finished => Some(ExecutionState::Finished),
            RunState::Failed => Some(ExecutionState::Failed),
            _ => None,
        };
        if reported.is_some() {
            for partition in &self.outputs {
                partition.finish();
            }
        }
        self.set_state(exit);
        if let Some(state) = reported {
            self.respond(ModificationResponse::TaskState(TaskStateUpdate {
                job_id: self.job_id,
                attempt_id: self.attempt_id,
                state,
            }));
        }
        info!(attempt = %self.attempt_id, task = %self.task_name, state = %exit, "run loop exited");
        exit
    }

    async fn run_inner(&mut self, shutdown: &mut watch::Receiver<bool>) -> TaskResult<RunState> {
        let pause = Arc::clone(&self.pause);
        loop {
            if *shutdown.borrow() {
                return Ok(RunState::Stopped);
            }
            if pause.is_paused() && self.wait_while_paused(shutdown).await? {
                return Ok(RunState::Stopped);
            }

            if let Some(element) = self.buffered.pop_front() {
                self.handle_input(element)?;
                continue;
            }

            let step = if self.operator.is_source() {
                let Some(record) = self.operator.next_record() else {
                    return Ok(RunState::Finished);
                };
                self.emit(record);
                tokio::select! {
                    biased;
                    res = shutdown.changed() => stop_if_closed(res),
                    _ = pause.changed() => Step::Recheck,
                    Some(event) = self.control.recv() => Step::Control(event),
                    _ = pace(self.source_interval) => Step::Recheck,
                }
            } else {
                tokio::select! {
                    biased;
                    res = shutdown.changed() => stop_if_closed(res),
                    _ = pause.changed() => Step::Recheck,
                    Some(event) = self.control.recv() => Step::Control(event),
                    element = recv_input(self.input.as_mut()) => Step::Input(element),
                }
            };

            match step {
                Step::Recheck => {}
                Step::Stop => return Ok(RunState::Stopped),
                Step::Control(event) => self.broadcast(&event)?,
                Step::Input(Some(element)) => self.handle_input(element)?,
                Step::Input(None) => return Ok(RunState::Finished),
            }
        }
    }

    /// Block while paused, buffering input. Returns true if the loop must
    /// stop instead of resuming.
    async fn wait_while_paused(&mut self, shutdown: &mut watch::Receiver<bool>) -> TaskResult<bool> {
        let pause = Arc::clone(&self.pause);
        self.set_state(RunState::PausedForModification);
        info!(attempt = %self.attempt_id, task = %self.task_name, "paused for modification");

        while pause.is_paused() {
            let step = tokio::select! {
                biased;
                res = shutdown.changed() => stop_if_closed(res),
                _ = pause.changed() => Step::Recheck,
                Some(event) = self.control.recv() => Step::Control(event),
                Some(element) = recv_input(self.input.as_mut()) => Step::Input(Some(element)),
            };
            match step {
                Step::Recheck | Step::Input(None) => {}
                Step::Stop => return Ok(true),
                Step::Control(event) => self.broadcast(&event)?,
                Step::Input(Some(element)) => {
                    if let WireElement::Event(bytes) = &element.element
                        && let ChannelEvent::Modification(marker) = event::decode(bytes)?
                    {
                        if self.on_marker(marker)? {
                            pause.resume();
                            info!(attempt = %self.attempt_id, "resumed by modification marker");
                        }
                        continue;
                    }
                    self.buffered.push_back(element);
                }
            }
            if *shutdown.borrow() {
                return Ok(true);
            }
        }

        debug!(attempt = %self.attempt_id, buffered = self.buffered.len(), "leaving pause");
        self.set_state(RunState::Running);
        Ok(false)
    }

    fn handle_input(&mut self, element: InputElement) -> TaskResult<()> {
        match element.element {
            WireElement::Record(record) => {
                for out in self.operator.process(record)? {
                    self.emit(out);
                }
            }
            WireElement::Event(bytes) => match event::decode(&bytes)? {
                ChannelEvent::Modification(marker) => {
                    self.on_marker(marker)?;
                }
                ChannelEvent::Task(TaskEvent::EndOfPartition) => {
                    trace!(attempt = %self.attempt_id, channel = element.channel, "end of partition");
                }
                other => self.broadcast(&other)?,
            },
        }
        Ok(())
    }

    /// Acknowledge a marker naming this attempt and forward it
    /// downstream. Returns whether this attempt is a target.
    fn on_marker(&mut self, marker: ModificationMarker) -> TaskResult<bool> {
        let target = marker.is_target(self.attempt_id);
        debug!(attempt = %self.attempt_id, %marker, target, "modification marker observed");
        if target {
            self.acknowledge(&marker);
        }
        self.broadcast(&ChannelEvent::Modification(marker))?;
        Ok(target)
    }

    fn acknowledge(&self, marker: &ModificationMarker) {
        self.respond(ModificationResponse::Acknowledge(AcknowledgeModification {
            job_id: self.job_id,
            attempt_id: self.attempt_id,
            modification_id: marker.modification_id(),
        }));
    }

    fn respond(&self, response: ModificationResponse) {
        let Some(responses) = &self.responses else {
            return;
        };
        if responses.send(response).is_err() {
            warn!(attempt = %self.attempt_id, "response channel closed, response dropped");
        }
    }

    fn emit(&self, record: Value) {
        for partition in &self.outputs {
            partition.emit(&record);
        }
    }

    fn broadcast(&self, event: &ChannelEvent) -> TaskResult<()> {
        for partition in &self.outputs {
            partition.broadcast(event)?;
        }
        Ok(())
    }

    fn set_state(&self, state: RunState) {
        self.state_tx.send_replace(state);
    }
}

fn stop_if_closed(res: Result<(), watch::error::RecvError>) -> Step {
    match res {
        Ok(()) => Step::Recheck,
        Err(_) => Step::Stop,
    }
}

async fn recv_input(input: Option<&mut InputReceiver>) -> Option<InputElement> {
    match input {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn pace(interval: Duration) {
    if interval.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(interval).await;
    }
}
