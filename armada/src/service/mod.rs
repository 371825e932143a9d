//! Service lifecycle management.
//!
//! Services are managed child processes created from declarative tasks.
//! The [`manager::CloudServiceManager`] owns placement, the
//! `PREPARED -> STARTING -> RUNNING -> STOPPED -> DELETED` state machine,
//! template/inclusion staging and deployments; the actual process spawn is
//! behind the pluggable [`runner::ServiceRunner`].

pub mod deployment;
pub mod error;
pub mod local;
pub mod manager;
pub mod placement;
pub mod runner;
pub mod screen;
pub mod snapshot;
pub mod task;
pub mod types;

pub use error::ServiceError;
pub use local::LocalService;
pub use manager::{BulkCreateResult, CloudServiceManager, CreateResult, ScreenTarget};
pub use runner::{LaunchContext, ProcessRunner, RunningService, ServiceRunner};
pub use snapshot::{ProcessSnapshot, ServiceInfoSnapshot, ServiceLifeCycle};
pub use task::{GroupConfiguration, ServiceTask};
pub use types::{
    ProcessConfig, ServiceConfiguration, ServiceDeployment, ServiceEnvironment, ServiceId,
    ServiceRemoteInclusion, ServiceTemplate,
};
