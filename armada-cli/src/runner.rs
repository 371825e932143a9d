//! Common command setup: logging, state directory and node boot.

use crate::error::CliError;
use armada::logging::{init_logging, LoggingGuard};
use armada::node::Node;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared bootstrap used by every subcommand.
pub struct CliRunner {
    state_dir: PathBuf,
    node_name: String,
    _logging: Option<LoggingGuard>,
}

impl CliRunner {
    pub fn new(state_dir: PathBuf, node_name: String, with_logging: bool) -> Result<Self, CliError> {
        let logging = if with_logging {
            let log_dir = state_dir.join("logs");
            Some(
                init_logging(&log_dir, "armada.log")
                    .map_err(|e| CliError::Failure(format!("unable to set up logging: {e}")))?,
            )
        } else {
            None
        };
        Ok(Self {
            state_dir,
            node_name,
            _logging: logging,
        })
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    /// Boots the node runtime for this state directory.
    pub async fn start_node(&self) -> Result<Arc<Node>, CliError> {
        Ok(Node::start(self.state_dir.clone(), &self.node_name).await?)
    }

    /// Boots the node, runs `action` against it and shuts down cleanly.
    pub async fn with_node<F, Fut, T>(&self, action: F) -> Result<T, CliError>
    where
        F: FnOnce(Arc<Node>) -> Fut,
        Fut: std::future::Future<Output = Result<T, CliError>>,
    {
        let node = self.start_node().await?;
        let result = action(Arc::clone(&node)).await;
        node.shutdown_handler().shutdown().await;
        result
    }
}
