//! Service manager error types.

use thiserror::Error;

/// Errors raised by the service manager.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No node satisfies the configuration's placement constraints.
    #[error("no placement candidate: {0}")]
    PlacementNoCandidate(String),

    /// The named task does not exist.
    #[error("service task {0} does not exist")]
    TaskNotFound(String),

    /// No service matches the given name or id.
    #[error("service {0} is not known")]
    ServiceNotFound(String),

    /// The cluster head did not reserve a task service id.
    #[error("task id reservation failed: {0}")]
    IdReservationFailed(String),

    /// Template copy, inclusion fetch or deployment failed.
    #[error("staging failed: {0}")]
    StagingFailed(String),

    /// The external runner could not launch or control the process.
    #[error("runner error: {0}")]
    RunnerFailed(String),

    /// A mutating call against a foreign service could not reach its
    /// owning node.
    #[error("owner node of {service} unreachable: {reason}")]
    OwnerUnreachable { service: String, reason: String },

    #[error(transparent)]
    Network(#[from] crate::network::NetworkError),

    #[error(transparent)]
    Template(#[from] crate::template::TemplateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
