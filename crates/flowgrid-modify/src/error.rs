//! Modification error types.

use flow_core::CoreError;
use flowgrid_graph::GraphError;
use thiserror::Error;

pub type ModifyResult<T> = Result<T, ModifyError>;

#[derive(Debug, Error)]
pub enum ModifyError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] CoreError),

    #[error("unknown modify command '{0}' (expected pause, resume, trigger, insert, grow, restart, or describe)")]
    UnknownCommand(String),

    #[error("'{command}' requires argument <{arg}>")]
    MissingArgument {
        command: &'static str,
        arg: &'static str,
    },

    #[error("job has failed: {0}")]
    JobFailed(String),
}
