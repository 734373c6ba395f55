//! flowgrid-task — the worker side of a running job.
//!
//! # Architecture
//!
//! ```text
//! LocalTaskExecutor (TaskGateway)
//!   ├── BlobCache              content-addressed operator resources
//!   ├── OperatorRegistry       invokable name → Invokable factory
//!   ├── partitions             partition id → ResultPartition
//!   └── tasks                  attempt id → RunLoop task
//!                                 ├── PauseSignal   (atomic flag)
//!                                 ├── control       injected events
//!                                 └── input  ◄──── subscribed partitions
//! ```
//!
//! Records and events share channels. Events are encoded with the codec in
//! [`event`], where the modification marker has its own framing.

pub mod error;
pub mod event;
pub mod marker;
pub mod operator;
pub mod partition;
pub mod pause;
pub mod run_loop;
pub mod worker;

pub use error::{TaskError, TaskResult};
pub use event::{ChannelEvent, TaskEvent};
pub use marker::ModificationMarker;
pub use operator::{Invokable, OperatorRegistry};
pub use partition::{ChannelWriter, InputElement, ResultPartition, WireElement};
pub use pause::PauseSignal;
pub use run_loop::{RunLoop, RunState};
pub use worker::{BlobCache, LocalTaskExecutor};
