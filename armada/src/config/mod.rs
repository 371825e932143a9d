//! Node configuration and on-disk persistence.
//!
//! A node's state directory holds a single `config.json` with the
//! [`ClusterConfig`], plus per-entity JSON files for tasks and groups.
//! Every write goes through write-then-rename so a crash never leaves a
//! half-written document behind.

mod cluster;
mod paths;
mod store;

pub use cluster::{ClusterConfig, NodeIdentity};
pub use paths::NodePaths;
pub use store::EntityStore;

use std::sync::{Arc, RwLock};
use thiserror::Error;

/// The live, mutable cluster configuration shared across subsystems.
pub type SharedConfig = Arc<RwLock<ClusterConfig>>;

/// Configuration errors. A malformed on-disk config aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a config document
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// Malformed config document
    #[error("invalid config document {path}: {source}")]
    Invalid {
        path: String,
        source: serde_json::Error,
    },

    /// Failed to write a config document
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}
