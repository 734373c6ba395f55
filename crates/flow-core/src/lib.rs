//! flow-core — types shared by every FlowGrid crate.
//!
//! - **`ids`**: opaque identifiers for jobs, vertices, results, attempts,
//!   and modifications
//! - **`blob`**: content-addressed keys for operator code and resources
//! - **`config`**: the `flowgrid.toml` configuration parser

pub mod blob;
pub mod config;
pub mod error;
pub mod ids;

pub use blob::{BlobKey, BlobSet};
pub use config::FlowConfig;
pub use error::{CoreError, CoreResult};
pub use ids::*;
