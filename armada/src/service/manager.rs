//! The cloud service manager.
//!
//! Places services on nodes, drives the lifecycle state machine, reserves
//! task service ids through the cluster head and answers service RPCs
//! forwarded by other nodes. Every `service_id.unique_id` is owned by
//! exactly one node; mutating calls against foreign services are forwarded
//! to the owner over the channel-message bus.

use super::error::ServiceError;
use super::local::{LifecycleUpdate, LocalService, ServiceContext, DEFAULT_STOP_TIMEOUT};
use super::placement;
use super::runner::ServiceRunner;
use super::snapshot::{ServiceInfoSnapshot, ServiceLifeCycle};
use super::task::{GroupConfiguration, ServiceTask};
use super::types::{ServiceConfiguration, ServiceId};
use crate::cluster::sync::keys;
use crate::cluster::{
    NodeDisconnectActions, NodeResourceSnapshot, NodeServerProvider, ServiceAuthenticator,
};
use crate::config::{EntityStore, NodePaths, SharedConfig};
use crate::event::{EventBus, NodeEvent};
use crate::messaging::{
    ChannelMessage, ChannelMessageTarget, ChannelMessenger, InboundContext, MessageHandler,
    ServiceChannelAccess, INTERNAL_CHANNEL,
};
use crate::network::{wire, ChannelAttachment, NetworkChannel};
use crate::registry::ServiceRegistry;
use crate::time::now_millis;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Window for service RPCs forwarded to other nodes.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Window for task id reservations routed through the head.
const RESERVATION_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an unused id reservation blocks the id.
const RESERVATION_TTL_MS: u64 = 30_000;

/// Outcome of a create request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CreateResult {
    Created { snapshot: ServiceInfoSnapshot },
    Failed { reason: String },
}

/// Outcome of a bulk create; stops at the first failure and leaves the
/// already-created services in place.
#[derive(Debug, Default)]
pub struct BulkCreateResult {
    pub created: Vec<ServiceInfoSnapshot>,
    pub failure: Option<String>,
}

/// Where toggled screen lines go.
#[derive(Clone)]
pub enum ScreenTarget {
    /// A caller's transport channel (remote CLI or node).
    Channel(Arc<NetworkChannel>),
    /// An in-process sink (local console).
    Local {
        token: u64,
        sink: mpsc::UnboundedSender<String>,
    },
}

impl ScreenTarget {
    fn key(&self) -> u64 {
        match self {
            // Channel ids and local tokens share a key space; local tokens
            // are allocated from the upper half.
            ScreenTarget::Channel(channel) => channel.id(),
            ScreenTarget::Local { token, .. } => *token,
        }
    }
}

static NEXT_SCREEN_TOKEN: AtomicU64 = AtomicU64::new(1 << 62);

/// Allocates a token for a local screen sink.
pub fn next_screen_token() -> u64 {
    NEXT_SCREEN_TOKEN.fetch_add(1, Ordering::Relaxed)
}

pub struct CloudServiceManager {
    context: Arc<ServiceContext>,
    paths: NodePaths,
    provider: Arc<NodeServerProvider>,
    messenger: Arc<ChannelMessenger>,
    events: Arc<EventBus>,
    tasks: Arc<EntityStore<ServiceTask>>,
    groups: Arc<EntityStore<GroupConfiguration>>,
    /// Services owned by this node, by unique id.
    local: DashMap<Uuid, Arc<LocalService>>,
    /// Replicated view of every known service in the cluster.
    known: DashMap<Uuid, ServiceInfoSnapshot>,
    /// Bound agent channels of local services.
    agents: DashMap<Uuid, Arc<NetworkChannel>>,
    /// Task id reservations, `(task, id) -> expiry millis`.
    reservations: DashMap<(String, u32), u64>,
    /// Screen forwarding targets per service.
    screens: DashMap<Uuid, Vec<ScreenTarget>>,
    /// Actually bound acceptor address, set after the server came up.
    node_address: std::sync::OnceLock<std::net::SocketAddr>,
}

impl CloudServiceManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        config: SharedConfig,
        paths: NodePaths,
        provider: Arc<NodeServerProvider>,
        messenger: Arc<ChannelMessenger>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let tasks = Arc::new(EntityStore::new(paths.tasks_dir()));
        let groups = Arc::new(EntityStore::new(paths.groups_dir()));
        Arc::new(Self {
            context: Arc::new(ServiceContext {
                registry,
                http: reqwest::Client::new(),
                config,
            }),
            paths,
            provider,
            messenger,
            events,
            tasks,
            groups,
            local: DashMap::new(),
            known: DashMap::new(),
            agents: DashMap::new(),
            reservations: DashMap::new(),
            screens: DashMap::new(),
            node_address: std::sync::OnceLock::new(),
        })
    }

    /// Records the bound acceptor address service agents dial back to.
    pub fn set_node_address(&self, address: std::net::SocketAddr) {
        let _ = self.node_address.set(address);
    }

    fn node_address(&self) -> std::net::SocketAddr {
        self.node_address.get().copied().unwrap_or_else(|| {
            self.provider
                .local_identity()
                .listen_addresses
                .first()
                .copied()
                .unwrap_or_else(|| "127.0.0.1:1410".parse().expect("static address parses"))
        })
    }

    /// Subscribes the manager's internal message handlers; called once
    /// during node wiring.
    pub fn register_message_handlers(self: &Arc<Self>) {
        self.messenger.subscribe(
            INTERNAL_CHANNEL,
            None,
            Arc::new(ManagerMessageHandler {
                manager: Arc::downgrade(self),
            }),
        );
    }

    fn local_node_name(&self) -> String {
        self.provider.local_identity().name.clone()
    }

    fn local_node_id(&self) -> Uuid {
        self.provider.local_identity().unique_id
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Replicated snapshots of every known service.
    pub fn services(&self) -> Vec<ServiceInfoSnapshot> {
        let mut services: Vec<_> = self.known.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| (s.service_id.task_name.clone(), s.service_id.name_suffix));
        services
    }

    pub fn service_by_name(&self, name: &str) -> Option<ServiceInfoSnapshot> {
        self.known
            .iter()
            .find(|e| e.value().name() == name)
            .map(|e| e.value().clone())
    }

    pub fn service_by_id(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        self.known.get(&unique_id).map(|e| e.value().clone())
    }

    pub fn local_service(&self, name: &str) -> Option<Arc<LocalService>> {
        self.local
            .iter()
            .find(|e| e.value().name() == name)
            .map(|e| e.value().clone())
    }

    pub fn local_service_by_id(&self, unique_id: Uuid) -> Option<Arc<LocalService>> {
        self.local.get(&unique_id).map(|e| e.value().clone())
    }

    pub fn local_service_count(&self) -> usize {
        self.local.len()
    }

    // ------------------------------------------------------------------
    // Task and group definitions
    // ------------------------------------------------------------------

    pub fn task_store(&self) -> &Arc<EntityStore<ServiceTask>> {
        &self.tasks
    }

    pub fn group_store(&self) -> &Arc<EntityStore<GroupConfiguration>> {
        &self.groups
    }

    pub fn task(&self, name: &str) -> Option<ServiceTask> {
        self.tasks.load(name).ok().flatten()
    }

    /// Persists a task and replicates it to the cluster.
    pub async fn save_task(&self, task: &ServiceTask) -> Result<(), ServiceError> {
        self.tasks
            .save(&task.name, task)
            .map_err(|e| ServiceError::StagingFailed(e.to_string()))?;
        self.broadcast_sync_record(keys::SERVICE_TASKS, task).await;
        Ok(())
    }

    /// Persists a group and replicates it to the cluster.
    pub async fn save_group(&self, group: &GroupConfiguration) -> Result<(), ServiceError> {
        self.groups
            .save(&group.name, group)
            .map_err(|e| ServiceError::StagingFailed(e.to_string()))?;
        self.broadcast_sync_record(keys::GROUP_CONFIGURATIONS, group)
            .await;
        Ok(())
    }

    async fn broadcast_sync_record<T: Serialize>(&self, key: &str, record: &T) {
        let mut content = BytesMut::new();
        wire::put_string(&mut content, key);
        wire::put_bytes(
            &mut content,
            &serde_json::to_vec(record).expect("record serializes"),
        );
        let message = ChannelMessage::builder()
            .target(ChannelMessageTarget::AllNodes)
            .channel(INTERNAL_CHANNEL)
            .message("sync_data")
            .content(content.freeze())
            .build();
        self.messenger.send(message).await;
    }

    // ------------------------------------------------------------------
    // Creation and placement
    // ------------------------------------------------------------------

    /// Creates one service from the configuration, placing it on the best
    /// candidate node (or the pinned one) and forwarding the create when
    /// the chosen node is not this one.
    pub async fn create(self: &Arc<Self>, configuration: ServiceConfiguration) -> CreateResult {
        let candidates = self.provider.placement_candidates();
        let head = self.provider.head_name();

        let chosen = match placement::choose_node(&candidates, &configuration, &head) {
            Some(chosen) => chosen.clone(),
            None => {
                let reason = match &configuration.node {
                    Some(node) => format!("node {node} is not an eligible candidate"),
                    None => "no node satisfies the configuration constraints".to_string(),
                };
                return CreateResult::Failed { reason };
            }
        };

        if chosen.node_name == self.local_node_name() {
            return self.create_local(configuration).await;
        }

        // Remote placement: pin the configuration and forward the create.
        let mut pinned = configuration;
        pinned.node = Some(chosen.node_name.clone());
        let content = serde_json::to_vec(&pinned).expect("configuration serializes");
        let query = ChannelMessage::builder()
            .target(ChannelMessageTarget::Node(chosen.node_name.clone()))
            .channel(INTERNAL_CHANNEL)
            .message("create_service")
            .content(Bytes::from(content))
            .as_query()
            .build();

        match self.messenger.send_single_query(query, RPC_TIMEOUT).await {
            Some(reply) => serde_json::from_slice(&reply.content).unwrap_or(CreateResult::Failed {
                reason: "malformed create reply".to_string(),
            }),
            None => CreateResult::Failed {
                reason: format!("node {} did not answer the create", chosen.node_name),
            },
        }
    }

    async fn create_local(self: &Arc<Self>, configuration: ServiceConfiguration) -> CreateResult {
        let suffix = match self
            .allocate_task_id(&configuration.task_name, configuration.task_id)
            .await
        {
            Ok(suffix) => suffix,
            Err(error) => {
                return CreateResult::Failed {
                    reason: error.to_string(),
                }
            }
        };

        let id = ServiceId {
            unique_id: Uuid::new_v4(),
            task_name: configuration.task_name.clone(),
            name_suffix: suffix,
            node_unique_id: self.local_node_id(),
            environment: configuration.environment,
        };
        let port = self.next_free_port(configuration.start_port);
        let node_ip = self
            .provider
            .local_identity()
            .listen_addresses
            .first()
            .map(|a| a.ip())
            .unwrap_or_else(|| std::net::IpAddr::from([127, 0, 0, 1]));
        let address = std::net::SocketAddr::new(node_ip, port);
        let directory = self.paths.services_dir().join(id.name());

        let service = match LocalService::new(
            id.clone(),
            configuration,
            directory,
            address,
            self.node_address(),
            Arc::clone(&self.context),
        ) {
            Ok(service) => service,
            Err(error) => {
                return CreateResult::Failed {
                    reason: error.to_string(),
                }
            }
        };

        let snapshot = service.snapshot().await;
        // The reservation is consumed by the created service itself.
        self.reservations
            .remove(&(id.task_name.clone(), id.name_suffix));
        self.local.insert(id.unique_id, Arc::clone(&service));
        self.publish_update(LifecycleUpdate {
            previous: ServiceLifeCycle::Prepared,
            snapshot: snapshot.clone(),
        })
        .await;
        self.refresh_local_resources().await;
        info!(service = %id.name(), "service prepared");
        CreateResult::Created { snapshot }
    }

    /// Creates `amount` services from a task; stops at the first failure,
    /// leaving the already-created services in place.
    pub async fn create_by_task(
        self: &Arc<Self>,
        task_name: &str,
        amount: u32,
        configure: &(dyn Fn(&mut ServiceConfiguration) + Send + Sync),
    ) -> Result<BulkCreateResult, ServiceError> {
        let task = self
            .task(task_name)
            .ok_or_else(|| ServiceError::TaskNotFound(task_name.to_string()))?;
        let groups = self.groups.load_all();

        let mut result = BulkCreateResult::default();
        for _ in 0..amount {
            let mut configuration = task.to_configuration(&groups);
            configure(&mut configuration);
            match self.create(configuration).await {
                CreateResult::Created { snapshot } => result.created.push(snapshot),
                CreateResult::Failed { reason } => {
                    result.failure = Some(reason);
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Allocates the next free task service id, routing through the head
    /// when this node is not the head. The lowest positive integer not in
    /// use by any known service of the task wins.
    pub async fn allocate_task_id(
        &self,
        task_name: &str,
        preferred: Option<u32>,
    ) -> Result<u32, ServiceError> {
        if self.provider.is_head_local() {
            return Ok(self.reserve_task_id_as_head(task_name, preferred));
        }

        let head = self.provider.head_name();
        let mut content = BytesMut::new();
        wire::put_string(&mut content, task_name);
        match preferred {
            Some(preferred) => {
                wire::put_bool(&mut content, true);
                wire::put_var_u64(&mut content, preferred as u64);
            }
            None => wire::put_bool(&mut content, false),
        }
        let query = ChannelMessage::builder()
            .target(ChannelMessageTarget::Node(head.clone()))
            .channel(INTERNAL_CHANNEL)
            .message("reserve_task_id")
            .content(content.freeze())
            .as_query()
            .build();

        let reply = self
            .messenger
            .send_single_query(query, RESERVATION_TIMEOUT)
            .await
            .ok_or_else(|| {
                ServiceError::IdReservationFailed(format!("head {head} did not answer"))
            })?;

        let mut content = reply.content.clone();
        let id = wire::get_var_u64(&mut content)
            .map_err(|e| ServiceError::IdReservationFailed(e.to_string()))? as u32;
        if id == 0 {
            return Err(ServiceError::IdReservationFailed(format!(
                "head {head} rejected the reservation"
            )));
        }
        // Mirror the reservation locally so concurrent local allocations
        // cannot hand out the same id before the create lands.
        self.reservations
            .insert((task_name.to_string(), id), now_millis() + RESERVATION_TTL_MS);
        Ok(id)
    }

    /// Head-side reservation: pick and reserve the id.
    fn reserve_task_id_as_head(&self, task_name: &str, preferred: Option<u32>) -> u32 {
        let now = now_millis();
        self.reservations.retain(|_, expiry| *expiry > now);

        let in_use = |candidate: u32| {
            let taken_by_service = self.known.iter().any(|e| {
                let snapshot = e.value();
                snapshot.service_id.task_name == task_name
                    && snapshot.service_id.name_suffix == candidate
                    && snapshot.life_cycle != ServiceLifeCycle::Deleted
            });
            taken_by_service
                || self
                    .reservations
                    .contains_key(&(task_name.to_string(), candidate))
        };

        let id = match preferred.filter(|p| *p > 0 && !in_use(*p)) {
            Some(preferred) => preferred,
            None => {
                let mut candidate = 1u32;
                while in_use(candidate) {
                    candidate += 1;
                }
                candidate
            }
        };
        self.reservations
            .insert((task_name.to_string(), id), now + RESERVATION_TTL_MS);
        id
    }

    fn next_free_port(&self, start_port: u16) -> u16 {
        let local_id = self.local_node_id();
        let taken: Vec<u16> = self
            .known
            .iter()
            .filter(|e| {
                e.value().service_id.node_unique_id == local_id
                    && e.value().life_cycle != ServiceLifeCycle::Deleted
            })
            .map(|e| e.value().address.port())
            .collect();
        let mut port = start_port;
        while taken.contains(&port) {
            port = port.saturating_add(1);
        }
        port
    }

    // ------------------------------------------------------------------
    // Lifecycle RPCs
    // ------------------------------------------------------------------

    /// Starts a service by display name, forwarding to its owner when it
    /// is not local.
    pub async fn start_service(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        self.service_op(name, "start").await
    }

    pub async fn stop_service(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        self.service_op(name, "stop").await
    }

    /// Restart preserves the service id: stop, then start.
    pub async fn restart_service(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        self.service_op(name, "restart").await
    }

    pub async fn delete_service(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        self.service_op(name, "delete").await
    }

    /// Executes the recorded deployments of a service immediately.
    pub async fn deploy_service(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        self.service_op(name, "deploy").await
    }

    async fn service_op(
        self: &Arc<Self>,
        name: &str,
        op: &str,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        if let Some(service) = self.local_service(name) {
            return self.execute_local_op(&service, op).await;
        }

        let snapshot = self
            .service_by_name(name)
            .ok_or_else(|| ServiceError::ServiceNotFound(name.to_string()))?;
        let owner = self
            .provider
            .node_server_by_id(snapshot.service_id.node_unique_id)
            .map(|n| n.identity.name.clone())
            .ok_or_else(|| ServiceError::OwnerUnreachable {
                service: name.to_string(),
                reason: "owning node is not in the roster".to_string(),
            })?;

        let mut content = BytesMut::new();
        wire::put_string(&mut content, op);
        wire::put_string(&mut content, name);
        let query = ChannelMessage::builder()
            .target(ChannelMessageTarget::Node(owner.clone()))
            .channel(INTERNAL_CHANNEL)
            .message("service_command")
            .content(content.freeze())
            .as_query()
            .build();

        let reply = self
            .messenger
            .send_single_query(query, RPC_TIMEOUT)
            .await
            .ok_or_else(|| ServiceError::OwnerUnreachable {
                service: name.to_string(),
                reason: format!("node {owner} did not answer"),
            })?;
        let snapshot: Option<ServiceInfoSnapshot> =
            serde_json::from_slice(&reply.content).map_err(|e| ServiceError::OwnerUnreachable {
                service: name.to_string(),
                reason: format!("malformed reply: {e}"),
            })?;
        snapshot.ok_or_else(|| ServiceError::ServiceNotFound(name.to_string()))
    }

    async fn execute_local_op(
        self: &Arc<Self>,
        service: &Arc<LocalService>,
        op: &str,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        match op {
            "start" => self.start_local(service).await,
            "stop" => {
                let outcome = service.stop(DEFAULT_STOP_TIMEOUT).await?;
                self.finish_op(service, outcome).await
            }
            "restart" => {
                // Stop first (ignoring an order violation when the service
                // was not running), then start with the same id.
                let outcome = service.stop(DEFAULT_STOP_TIMEOUT).await?;
                self.finish_op(service, outcome).await?;
                self.start_local(service).await
            }
            "delete" => {
                // A running service is stopped first so the observed
                // lifecycle stays on the allowed line.
                if matches!(
                    service.life_cycle().await,
                    ServiceLifeCycle::Running | ServiceLifeCycle::Starting
                ) {
                    let outcome = service.stop(DEFAULT_STOP_TIMEOUT).await?;
                    self.finish_op(service, outcome).await?;
                }
                let outcome = service.delete().await?;
                let snapshot = self.finish_op(service, outcome).await?;
                if snapshot.life_cycle == ServiceLifeCycle::Deleted {
                    let unique_id = service.service_id().unique_id;
                    self.local.remove(&unique_id);
                    self.agents.remove(&unique_id);
                    self.screens.remove(&unique_id);
                    self.refresh_local_resources().await;
                }
                Ok(snapshot)
            }
            "deploy" => Ok(service.deploy_now().await?),
            other => Err(ServiceError::ServiceNotFound(format!(
                "unknown service operation {other}"
            ))),
        }
    }

    async fn start_local(
        self: &Arc<Self>,
        service: &Arc<LocalService>,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        let runner = self
            .context
            .registry
            .default_instance::<dyn ServiceRunner>()
            .map_err(|e| ServiceError::RunnerFailed(e.to_string()))?;

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        self.spawn_line_pump(Arc::clone(service), log_rx);

        let outcome = service.start(runner, log_tx).await?;
        self.finish_op(service, outcome).await
    }

    async fn finish_op(
        self: &Arc<Self>,
        service: &Arc<LocalService>,
        outcome: super::local::OpOutcome,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        for update in outcome.updates {
            self.publish_update(update).await;
        }
        match outcome.snapshot {
            Some(snapshot) => Ok(snapshot),
            None => Ok(service.snapshot().await),
        }
    }

    // ------------------------------------------------------------------
    // Snapshot publication and replication
    // ------------------------------------------------------------------

    /// Publishes one lifecycle transition: replicated map, local event,
    /// cluster broadcast, and the lifecycle message to local agents.
    pub(crate) async fn publish_update(&self, update: LifecycleUpdate) {
        let snapshot = update.snapshot.clone();
        let unique_id = snapshot.service_id.unique_id;

        if snapshot.life_cycle == ServiceLifeCycle::Deleted && !self.local.contains_key(&unique_id)
        {
            // Tombstones of foreign services are garbage-collected after
            // publication; locally owned ones are removed by the delete op.
            self.known.remove(&unique_id);
        } else {
            self.known.insert(unique_id, snapshot.clone());
        }

        self.events.publish(NodeEvent::ServiceLifecycleChange {
            previous: update.previous,
            snapshot: snapshot.clone(),
        });

        self.broadcast_sync_record(keys::SERVICE_SNAPSHOTS, &snapshot)
            .await;
        self.notify_local_agents(&update).await;

        if snapshot.life_cycle == ServiceLifeCycle::Deleted {
            self.known.remove(&unique_id);
        }
    }

    async fn notify_local_agents(&self, update: &LifecycleUpdate) {
        if self.agents.is_empty() {
            return;
        }
        let targets: Vec<ChannelMessageTarget> = self
            .local
            .iter()
            .filter(|e| self.agents.contains_key(e.key()))
            .map(|e| ChannelMessageTarget::Service(e.value().name()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let content = serde_json::json!({
            "previous": update.previous,
            "snapshot": update.snapshot,
        });
        let message = ChannelMessage::builder()
            .targets(targets)
            .channel(INTERNAL_CHANNEL)
            .message("update_service_lifecycle")
            .content(Bytes::from(
                serde_json::to_vec(&content).expect("update serializes"),
            ))
            .build();
        self.messenger.send(message).await;
    }

    /// Writer callback of the service snapshot sync handler: applies a
    /// snapshot replicated from another node.
    pub fn apply_replicated_snapshot(&self, snapshot: ServiceInfoSnapshot) {
        let unique_id = snapshot.service_id.unique_id;
        if self.local.contains_key(&unique_id) {
            // This node owns the service; its own state is authoritative.
            return;
        }

        let previous = self
            .known
            .get(&unique_id)
            .map(|e| e.value().life_cycle)
            .unwrap_or(snapshot.life_cycle);

        if snapshot.life_cycle == ServiceLifeCycle::Deleted {
            self.known.remove(&unique_id);
        } else {
            self.known.insert(unique_id, snapshot.clone());
        }
        self.events.publish(NodeEvent::ServiceLifecycleChange {
            previous,
            snapshot,
        });
    }

    /// Collector callback of the snapshot sync handler.
    pub fn known_snapshots(&self) -> Vec<ServiceInfoSnapshot> {
        self.known.iter().map(|e| e.value().clone()).collect()
    }

    pub fn known_snapshot_of(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        self.known.get(&unique_id).map(|e| e.value().clone())
    }

    /// Recomputes and replicates this node's resource usage.
    pub async fn refresh_local_resources(&self) {
        let local_id = self.local_node_id();
        let mut used = 0u64;
        let mut count = 0u32;
        for entry in self.known.iter() {
            let snapshot = entry.value();
            if snapshot.service_id.node_unique_id == local_id
                && snapshot.life_cycle != ServiceLifeCycle::Deleted
            {
                used += snapshot.configuration.process.max_heap_mib;
                count += 1;
            }
        }

        let resources = NodeResourceSnapshot {
            node_name: self.local_node_name(),
            node_unique_id: local_id,
            max_memory_mib: {
                let config = self.context.config.read().unwrap_or_else(|e| e.into_inner());
                config.max_memory_mib
            },
            used_memory_mib: used,
            service_count: count,
            cpu_load: 0.0,
            drain: self.provider.local_drain(),
            timestamp_ms: now_millis(),
        };
        self.provider.set_local_resources(resources.clone());
        self.broadcast_sync_record(keys::NODE_RESOURCES, &resources)
            .await;
    }

    // ------------------------------------------------------------------
    // Screen forwarding and console
    // ------------------------------------------------------------------

    fn spawn_line_pump(
        self: &Arc<Self>,
        service: Arc<LocalService>,
        mut lines: mpsc::UnboundedReceiver<String>,
    ) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.handle_console_line(&service, line).await;
            }
        });
    }

    async fn handle_console_line(&self, service: &Arc<LocalService>, line: String) {
        service.screen.push(line.clone());
        self.events.publish(NodeEvent::ServiceLogEntry {
            service_name: service.name(),
            line: line.clone(),
        });
        self.forward_screen_line(service, &line).await;
    }

    async fn forward_screen_line(&self, service: &Arc<LocalService>, line: &str) {
        let unique_id = service.service_id().unique_id;
        // Snapshot the target list; sending must not hold the map lock.
        let targets: Vec<ScreenTarget> = match self.screens.get(&unique_id) {
            Some(targets) => targets.value().clone(),
            None => return,
        };

        let mut dead_locals = Vec::new();
        for target in &targets {
            match target {
                ScreenTarget::Channel(channel) => {
                    let message = screen_line_message(&service.name(), line);
                    self.messenger.send_via_channel(channel, message).await;
                }
                ScreenTarget::Local { token, sink } => {
                    if sink.send(line.to_string()).is_err() {
                        dead_locals.push(*token);
                    }
                }
            }
        }

        if !dead_locals.is_empty() {
            if let Some(mut targets) = self.screens.get_mut(&unique_id) {
                targets.retain(|t| !dead_locals.contains(&t.key()));
            }
        }
    }

    /// Toggles screen forwarding of a local service to the given target.
    /// Returns whether forwarding is now enabled; enabling replays the
    /// cached backlog first.
    pub async fn toggle_screen(
        &self,
        name: &str,
        target: ScreenTarget,
    ) -> Result<bool, ServiceError> {
        let service = self
            .local_service(name)
            .ok_or_else(|| ServiceError::ServiceNotFound(name.to_string()))?;
        let unique_id = service.service_id().unique_id;
        let key = target.key();

        // Flip membership in a short critical section, replay the backlog
        // afterwards without holding the map lock.
        let enabled = {
            let mut targets = self.screens.entry(unique_id).or_default();
            if let Some(position) = targets.iter().position(|t| t.key() == key) {
                targets.remove(position);
                false
            } else {
                targets.push(target.clone());
                true
            }
        };
        if !enabled {
            return Ok(false);
        }

        let backlog = service.screen.backlog();
        match &target {
            ScreenTarget::Channel(channel) => {
                for line in &backlog {
                    let message = screen_line_message(name, line);
                    self.messenger.send_via_channel(channel, message).await;
                }
            }
            ScreenTarget::Local { sink, .. } => {
                for line in &backlog {
                    let _ = sink.send(line.clone());
                }
            }
        }
        Ok(true)
    }

    /// Sends a command line to a service console, forwarding to the owner
    /// node for foreign services.
    pub async fn send_command_line(
        self: &Arc<Self>,
        name: &str,
        line: &str,
    ) -> Result<(), ServiceError> {
        if let Some(service) = self.local_service(name) {
            return service.send_command(line).await;
        }

        let snapshot = self
            .service_by_name(name)
            .ok_or_else(|| ServiceError::ServiceNotFound(name.to_string()))?;
        let owner = self
            .provider
            .node_server_by_id(snapshot.service_id.node_unique_id)
            .map(|n| n.identity.name.clone())
            .ok_or_else(|| ServiceError::OwnerUnreachable {
                service: name.to_string(),
                reason: "owning node is not in the roster".to_string(),
            })?;

        let mut content = BytesMut::new();
        wire::put_string(&mut content, name);
        wire::put_string(&mut content, line);
        let message = ChannelMessage::builder()
            .target(ChannelMessageTarget::Node(owner))
            .channel(INTERNAL_CHANNEL)
            .message("service_console")
            .content(content.freeze())
            .build();
        self.messenger.send(message).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stops every local service, best effort.
    pub async fn stop_all_services(self: &Arc<Self>) {
        let services: Vec<_> = self.local.iter().map(|e| e.value().clone()).collect();
        for service in services {
            if matches!(
                service.life_cycle().await,
                ServiceLifeCycle::Running | ServiceLifeCycle::Starting
            ) {
                match service.stop(DEFAULT_STOP_TIMEOUT).await {
                    Ok(outcome) => {
                        let _ = self.finish_op(&service, outcome).await;
                    }
                    Err(error) => warn!(service = %service.name(), %error, "stop failed"),
                }
            }
        }
    }
}

fn screen_line_message(service_name: &str, line: &str) -> ChannelMessage {
    let mut content = BytesMut::new();
    wire::put_string(&mut content, service_name);
    wire::put_string(&mut content, line);
    ChannelMessage::builder()
        .target(ChannelMessageTarget::AllNodes)
        .channel(INTERNAL_CHANNEL)
        .message("screen_line")
        .content(content.freeze())
        .build()
}

// ----------------------------------------------------------------------
// Cluster integration
// ----------------------------------------------------------------------

#[async_trait]
impl ServiceAuthenticator for CloudServiceManager {
    async fn authenticate_agent(
        &self,
        connection_key: &str,
        service_id: &ServiceId,
        channel: &Arc<NetworkChannel>,
    ) -> bool {
        let Some(service) = self.local_service_by_id(service_id.unique_id) else {
            return false;
        };
        if service.connection_key() != connection_key {
            warn!(service = %service.name(), "agent presented a wrong connection key");
            return false;
        }

        let outcome = service.bind_agent(Arc::clone(channel)).await;
        self.agents
            .insert(service_id.unique_id, Arc::clone(channel));
        for update in outcome.updates {
            self.publish_update(update).await;
        }
        true
    }
}

#[async_trait]
impl NodeDisconnectActions for CloudServiceManager {
    /// Rewrites every service owned by the lost node to a DELETED
    /// tombstone and tells local agents, so they stop routing players to
    /// the dead host.
    async fn handle_node_disconnect(&self, node_unique_id: Uuid, node_name: &str) {
        let affected: Vec<ServiceInfoSnapshot> = self
            .known
            .iter()
            .filter(|e| {
                e.value().service_id.node_unique_id == node_unique_id
                    && e.value().life_cycle != ServiceLifeCycle::Deleted
            })
            .map(|e| e.value().clone())
            .collect();

        for snapshot in affected {
            let previous = snapshot.life_cycle;
            let tombstone = snapshot.as_tombstone();
            self.known.remove(&tombstone.service_id.unique_id);
            self.events.publish(NodeEvent::ServiceLifecycleChange {
                previous,
                snapshot: tombstone.clone(),
            });
            self.notify_local_agents(&LifecycleUpdate {
                previous,
                snapshot: tombstone,
            })
            .await;
        }
        debug!(node = %node_name, "rewrote services of disconnected node");
    }
}

impl ServiceChannelAccess for CloudServiceManager {
    fn local_agent_channels(&self) -> Vec<(String, Arc<NetworkChannel>)> {
        self.agents
            .iter()
            .filter_map(|entry| {
                self.local
                    .get(entry.key())
                    .map(|service| (service.name(), entry.value().clone()))
            })
            .collect()
    }

    fn local_agent_channel(&self, name: &str) -> Option<Arc<NetworkChannel>> {
        let service = self.local_service(name)?;
        self.agents
            .get(&service.service_id().unique_id)
            .map(|e| e.value().clone())
    }

    fn owner_node_of(&self, service_name: &str) -> Option<String> {
        let snapshot = self.service_by_name(service_name)?;
        if snapshot.service_id.node_unique_id == self.local_node_id() {
            return Some(self.local_node_name());
        }
        self.provider
            .node_server_by_id(snapshot.service_id.node_unique_id)
            .map(|n| n.identity.name.clone())
    }

    fn expand_target(&self, target: &ChannelMessageTarget) -> Vec<String> {
        self.known
            .iter()
            .filter(|e| e.value().life_cycle != ServiceLifeCycle::Deleted)
            .filter(|e| match target {
                ChannelMessageTarget::Task(task) => e.value().service_id.task_name == *task,
                ChannelMessageTarget::Group(group) => {
                    e.value().configuration.groups.contains(group)
                }
                ChannelMessageTarget::Environment(environment) => {
                    e.value().service_id.environment == *environment
                }
                _ => false,
            })
            .map(|e| e.value().name())
            .collect()
    }
}

// ----------------------------------------------------------------------
// Internal message handler
// ----------------------------------------------------------------------

struct ManagerMessageHandler {
    manager: Weak<CloudServiceManager>,
}

#[async_trait]
impl MessageHandler for ManagerMessageHandler {
    async fn handle(&self, message: &ChannelMessage, context: &InboundContext) -> Option<Bytes> {
        let manager = self.manager.upgrade()?;
        match message.message.as_str() {
            "reserve_task_id" => {
                let mut content = message.content.clone();
                let task = wire::get_string(&mut content).ok()?;
                let preferred = if wire::get_bool(&mut content).ok()? {
                    Some(wire::get_var_u64(&mut content).ok()? as u32)
                } else {
                    None
                };
                let id = if manager.provider.is_head_local() {
                    manager.reserve_task_id_as_head(&task, preferred)
                } else {
                    // Not the head: refuse so the caller retries against
                    // the proper coordinator.
                    0
                };
                let mut reply = BytesMut::new();
                wire::put_var_u64(&mut reply, id as u64);
                Some(reply.freeze())
            }
            "create_service" => {
                let configuration: ServiceConfiguration =
                    serde_json::from_slice(&message.content).ok()?;
                let result = manager.create(configuration).await;
                Some(Bytes::from(
                    serde_json::to_vec(&result).expect("create result serializes"),
                ))
            }
            "service_command" => {
                let mut content = message.content.clone();
                let op = wire::get_string(&mut content).ok()?;
                let name = wire::get_string(&mut content).ok()?;
                let snapshot = match manager.local_service(&name) {
                    Some(service) => manager.execute_local_op(&service, &op).await.ok(),
                    None => None,
                };
                Some(Bytes::from(
                    serde_json::to_vec(&snapshot).expect("snapshot serializes"),
                ))
            }
            "service_console" => {
                let mut content = message.content.clone();
                let name = wire::get_string(&mut content).ok()?;
                let line = wire::get_string(&mut content).ok()?;
                if let Some(service) = manager.local_service(&name) {
                    if let Err(error) = service.send_command(&line).await {
                        warn!(service = %name, %error, "console forward failed");
                    }
                }
                None
            }
            "toggle_screen" => {
                let mut content = message.content.clone();
                let name = wire::get_string(&mut content).ok()?;
                let channel = context.origin.clone()?;
                let enabled = manager
                    .toggle_screen(&name, ScreenTarget::Channel(channel))
                    .await
                    .unwrap_or(false);
                let mut reply = BytesMut::new();
                wire::put_bool(&mut reply, enabled);
                Some(reply.freeze())
            }
            "update_service_info" => {
                // Published by an in-service agent over its channel. The
                // cached snapshot only refreshes for the matching service.
                let incoming: ServiceInfoSnapshot =
                    serde_json::from_slice(&message.content).ok()?;
                let origin = context.origin.as_ref()?;
                let Some(ChannelAttachment::Service { unique_id }) = origin.attachment() else {
                    return None;
                };
                let service = manager.local_service_by_id(unique_id)?;
                if let Some(snapshot) = service.apply_agent_snapshot(incoming).await {
                    manager
                        .publish_update(LifecycleUpdate {
                            previous: snapshot.life_cycle,
                            snapshot,
                        })
                        .await;
                }
                None
            }
            _ => None,
        }
    }
}
