//! Task runtime error types.

use thiserror::Error;

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("modification marker on the generic event path; it must use its dedicated framing")]
    MarkerOnGenericPath,

    #[error("truncated event frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown event tag {0:#04x}")]
    UnknownTag(u8),

    #[error("malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("operator '{operator}' failed: {reason}")]
    Operator { operator: String, reason: String },
}
