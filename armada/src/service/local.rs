//! Local service instances and their lifecycle state machine.

use super::deployment::select_files;
use super::error::ServiceError;
use super::runner::{LaunchContext, RunningService, ServiceRunner};
use super::screen::ScreenBuffer;
use super::snapshot::{ProcessSnapshot, ServiceInfoSnapshot, ServiceLifeCycle};
use super::types::{ServiceConfiguration, ServiceId};
use crate::config::SharedConfig;
use crate::network::NetworkChannel;
use crate::registry::ServiceRegistry;
use crate::template::TemplateStorage;
use crate::time::now_millis;
use rand::distr::{Alphanumeric, SampleString};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Window a service gets to stop gracefully before it is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared collaborators of all local services.
pub(crate) struct ServiceContext {
    pub registry: Arc<ServiceRegistry>,
    pub http: reqwest::Client,
    pub config: SharedConfig,
}

/// One lifecycle transition to publish to the cluster.
#[derive(Clone, Debug)]
pub(crate) struct LifecycleUpdate {
    pub previous: ServiceLifeCycle,
    pub snapshot: ServiceInfoSnapshot,
}

/// Result of a lifecycle operation.
#[derive(Debug, Default)]
pub(crate) struct OpOutcome {
    /// Snapshot after the operation.
    pub snapshot: Option<ServiceInfoSnapshot>,
    /// Transitions that happened, in order.
    pub updates: Vec<LifecycleUpdate>,
    /// The request violated lifecycle order and changed nothing.
    pub violation: bool,
    /// Staging or launch failure detail, if any.
    pub failure: Option<String>,
}

struct ServiceState {
    snapshot: ServiceInfoSnapshot,
    channel: Option<Arc<NetworkChannel>>,
    running: Option<Box<dyn RunningService>>,
    /// Deployment spec recorded at staging for "deploy on stop".
    recorded_deployments: Vec<super::types::ServiceDeployment>,
}

/// A service owned by this node.
///
/// All state mutations run under the per-service lock; reads clone the
/// last snapshot.
pub struct LocalService {
    id: ServiceId,
    configuration: ServiceConfiguration,
    connection_key: String,
    directory: PathBuf,
    /// Address of the owning node's transport acceptor, dialed back by
    /// the in-service agent.
    node_address: SocketAddr,
    pub(crate) screen: ScreenBuffer,
    context: Arc<ServiceContext>,
    state: Mutex<ServiceState>,
}

impl LocalService {
    pub(crate) fn new(
        id: ServiceId,
        configuration: ServiceConfiguration,
        directory: PathBuf,
        address: SocketAddr,
        node_address: SocketAddr,
        context: Arc<ServiceContext>,
    ) -> Result<Arc<Self>, ServiceError> {
        std::fs::create_dir_all(&directory)?;
        let connection_key = Alphanumeric.sample_string(&mut rand::rng(), 32);
        let snapshot = ServiceInfoSnapshot::new(id.clone(), address, configuration.clone());

        Ok(Arc::new(Self {
            id,
            configuration,
            connection_key,
            directory,
            node_address,
            screen: ScreenBuffer::default(),
            context,
            state: Mutex::new(ServiceState {
                snapshot,
                channel: None,
                running: None,
                recorded_deployments: Vec::new(),
            }),
        }))
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.id
    }

    pub fn name(&self) -> String {
        self.id.name()
    }

    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    pub(crate) fn connection_key(&self) -> &str {
        &self.connection_key
    }

    pub async fn snapshot(&self) -> ServiceInfoSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    pub async fn life_cycle(&self) -> ServiceLifeCycle {
        self.state.lock().await.snapshot.life_cycle
    }

    pub async fn agent_channel(&self) -> Option<Arc<NetworkChannel>> {
        self.state.lock().await.channel.clone()
    }

    /// Starts the service: stage templates and inclusions, record the
    /// deployment spec, transition to STARTING and launch the process.
    /// RUNNING is reached when the agent channel binds.
    pub(crate) async fn start(
        self: &Arc<Self>,
        runner: Arc<dyn ServiceRunner>,
        log_lines: mpsc::UnboundedSender<String>,
    ) -> Result<OpOutcome, ServiceError> {
        let mut state = self.state.lock().await;
        let current = state.snapshot.life_cycle;
        if !matches!(current, ServiceLifeCycle::Prepared | ServiceLifeCycle::Stopped) {
            return Ok(violation(&state.snapshot));
        }

        let mut outcome = OpOutcome::default();

        // Staging is idempotent and may be retried; failures stay on the
        // snapshot and never move the lifecycle beyond STOPPED.
        if let Err(error) = self.stage(&mut state).await {
            let detail = error.to_string();
            warn!(service = %self.name(), %detail, "staging failed");
            state.snapshot.properties.insert(
                "preparation_failed".to_string(),
                serde_json::Value::String(detail.clone()),
            );
            outcome.snapshot = Some(state.snapshot.clone());
            outcome.failure = Some(detail);
            return Ok(outcome);
        }
        state.snapshot.properties.remove("preparation_failed");

        transition(&mut state.snapshot, ServiceLifeCycle::Starting, &mut outcome);

        let launch = LaunchContext {
            service_id: self.id.clone(),
            directory: self.directory.clone(),
            command: {
                let config = self.context.config.read().unwrap_or_else(|e| e.into_inner());
                config.java_command.clone()
            },
            process: self.configuration.process.clone(),
            connection_key: self.connection_key.clone(),
            node_address: self.node_address,
            port: state.snapshot.address.port(),
        };

        match runner.launch(&launch, log_lines).await {
            Ok(handle) => {
                state.snapshot.process_snapshot = ProcessSnapshot {
                    pid: handle.pid(),
                    cpu_usage: 0.0,
                    heap_usage_mib: 0,
                    max_heap_mib: self.configuration.process.max_heap_mib,
                };
                state.running = Some(handle);
                info!(service = %self.name(), "service launching");
            }
            Err(error) => {
                let detail = error.to_string();
                warn!(service = %self.name(), %detail, "launch failed");
                transition(&mut state.snapshot, ServiceLifeCycle::Stopped, &mut outcome);
                outcome.failure = Some(detail);
            }
        }

        outcome.snapshot = Some(state.snapshot.clone());
        Ok(outcome)
    }

    async fn stage(&self, state: &mut ServiceState) -> Result<(), ServiceError> {
        // Phase 1: materialize templates.
        for template in &self.configuration.templates {
            let storage = self
                .context
                .registry
                .registration::<dyn TemplateStorage>(&template.storage)
                .ok_or_else(|| {
                    ServiceError::StagingFailed(format!(
                        "template storage {} is not registered",
                        template.storage
                    ))
                })?
                .instance();
            storage
                .copy_template_into(template, &self.directory)
                .map_err(|e| ServiceError::StagingFailed(e.to_string()))?;
        }

        // Phase 2: fetch remote inclusions.
        for inclusion in &self.configuration.inclusions {
            let response = self
                .context
                .http
                .get(&inclusion.url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| {
                    ServiceError::StagingFailed(format!("inclusion {} failed: {e}", inclusion.url))
                })?;
            let body = response.bytes().await.map_err(|e| {
                ServiceError::StagingFailed(format!("inclusion {} failed: {e}", inclusion.url))
            })?;

            let destination = self.directory.join(&inclusion.destination);
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&destination, &body).await?;
            debug!(service = %self.name(), url = %inclusion.url, "inclusion fetched");
        }

        // Phase 3: record the deployment spec for deploy-on-stop.
        state.recorded_deployments = self.configuration.deployments.clone();
        Ok(())
    }

    /// Stops the service: execute recorded deployments, stop the process,
    /// transition to STOPPED.
    pub(crate) async fn stop(&self, timeout: Duration) -> Result<OpOutcome, ServiceError> {
        let mut state = self.state.lock().await;
        if !matches!(
            state.snapshot.life_cycle,
            ServiceLifeCycle::Running | ServiceLifeCycle::Starting
        ) {
            return Ok(violation(&state.snapshot));
        }

        let mut outcome = OpOutcome::default();
        self.execute_recorded_deployments(&mut state);

        if let Some(running) = state.running.take() {
            if let Err(error) = running.stop(timeout).await {
                warn!(service = %self.name(), %error, "forced stop failed");
            }
        }
        if let Some(channel) = state.channel.take() {
            channel.close();
        }

        state.snapshot.process_snapshot = ProcessSnapshot::empty();
        state.snapshot.connected_time_ms = -1;
        transition(&mut state.snapshot, ServiceLifeCycle::Stopped, &mut outcome);
        outcome.snapshot = Some(state.snapshot.clone());
        info!(service = %self.name(), "service stopped");
        Ok(outcome)
    }

    /// Deletes the service (STOPPED -> DELETED tombstone).
    pub(crate) async fn delete(&self) -> Result<OpOutcome, ServiceError> {
        let mut state = self.state.lock().await;
        if state.snapshot.life_cycle != ServiceLifeCycle::Stopped {
            return Ok(violation(&state.snapshot));
        }

        let mut outcome = OpOutcome::default();
        transition(&mut state.snapshot, ServiceLifeCycle::Deleted, &mut outcome);
        outcome.snapshot = Some(state.snapshot.clone());
        info!(service = %self.name(), "service deleted");
        Ok(outcome)
    }

    /// Executes the recorded deployments immediately and clears the spec.
    pub(crate) async fn deploy_now(&self) -> Result<ServiceInfoSnapshot, ServiceError> {
        let mut state = self.state.lock().await;
        self.execute_recorded_deployments(&mut state);
        Ok(state.snapshot.clone())
    }

    fn execute_recorded_deployments(&self, state: &mut ServiceState) {
        // Deployments run in submission order; individual failures are
        // logged and do not abort the remaining deployments.
        let deployments = std::mem::take(&mut state.recorded_deployments);
        for deployment in deployments {
            let files = select_files(&self.directory, &deployment);
            let storage = match self
                .context
                .registry
                .registration::<dyn TemplateStorage>(&deployment.template.storage)
            {
                Some(registration) => registration.instance(),
                None => {
                    warn!(
                        template = %deployment.template,
                        "deployment storage not registered, skipping"
                    );
                    continue;
                }
            };
            match storage.deploy_into_template(&deployment.template, &self.directory, &files) {
                Ok(written) => {
                    debug!(service = %self.name(), template = %deployment.template, written, "deployment executed")
                }
                Err(error) => {
                    warn!(service = %self.name(), template = %deployment.template, %error, "deployment failed")
                }
            }
        }
    }

    /// Binds the authenticated agent channel (STARTING -> RUNNING).
    pub(crate) async fn bind_agent(&self, channel: Arc<NetworkChannel>) -> OpOutcome {
        let mut state = self.state.lock().await;
        state.channel = Some(channel);
        state.snapshot.connected_time_ms = now_millis() as i64;

        let mut outcome = OpOutcome::default();
        if state.snapshot.life_cycle == ServiceLifeCycle::Starting {
            transition(&mut state.snapshot, ServiceLifeCycle::Running, &mut outcome);
        }
        outcome.snapshot = Some(state.snapshot.clone());
        outcome
    }

    /// Applies a snapshot update published by the in-service agent. The
    /// cached snapshot is only refreshed when the id matches this service.
    pub(crate) async fn apply_agent_snapshot(&self, incoming: ServiceInfoSnapshot) -> Option<ServiceInfoSnapshot> {
        if incoming.service_id.unique_id != self.id.unique_id {
            return None;
        }
        let mut state = self.state.lock().await;
        state.snapshot.process_snapshot = incoming.process_snapshot;
        state.snapshot.properties = incoming.properties;
        Some(state.snapshot.clone())
    }

    /// Writes a command line to the service console.
    pub(crate) async fn send_command(&self, line: &str) -> Result<(), ServiceError> {
        let state = self.state.lock().await;
        match &state.running {
            Some(running) => running.send_command(line).await,
            None => Err(ServiceError::RunnerFailed(format!(
                "service {} has no running process",
                self.name()
            ))),
        }
    }
}

fn violation(snapshot: &ServiceInfoSnapshot) -> OpOutcome {
    OpOutcome {
        snapshot: Some(snapshot.clone()),
        updates: Vec::new(),
        violation: true,
        failure: None,
    }
}

fn transition(
    snapshot: &mut ServiceInfoSnapshot,
    next: ServiceLifeCycle,
    outcome: &mut OpOutcome,
) {
    let previous = snapshot.life_cycle;
    debug_assert!(previous.can_transition_to(next));
    snapshot.life_cycle = next;
    outcome.updates.push(LifecycleUpdate {
        previous,
        snapshot: snapshot.clone(),
    });
}
