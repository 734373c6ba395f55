//! Error types for configuration and identifier parsing.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid blob key: {0}")]
    InvalidBlobKey(String),
}
