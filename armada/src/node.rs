//! Node runtime wiring.
//!
//! [`Node`] constructs and connects every subsystem: registry, event bus,
//! tick loop, transports, channel messenger, cluster provider, data sync
//! and the service manager. It is instantiated once in `main` and threaded
//! through constructors; [`Node::global`] exists only for call sites that
//! cannot carry the handle.

use crate::cluster::sync::{keys, DataSyncHandler, DataSyncRegistry};
use crate::cluster::{
    AuthPacketListener, NodeChannelCloseListener, NodeDisconnectActions, NodeResourceSnapshot,
    NodeServerProvider, ServiceAuthenticator, SyncAckPacketListener,
};
use crate::config::{ClusterConfig, ConfigError, NodePaths, SharedConfig};
use crate::database::{DatabaseProvider, JsonFileDatabaseProvider, MemoryDatabaseProvider};
use crate::event::EventBus;
use crate::messaging::{
    ChannelMessage, ChannelMessageListener, ChannelMessenger, ClusterChannelAccess,
    InboundContext, MessageHandler, QueryResponseListener, ServiceChannelAccess, INTERNAL_CHANNEL,
};
use crate::network::chunk::ChunkedSessionRegistry;
use crate::network::{
    channels, wire, NetworkClient, NetworkError, NetworkServer, PacketListenerRegistry,
};
use crate::registry::ServiceRegistry;
use crate::service::{
    CloudServiceManager, GroupConfiguration, ProcessRunner, ServiceInfoSnapshot, ServiceRunner,
    ServiceTask,
};
use crate::shutdown::ShutdownHandler;
use crate::template::{LocalTemplateStorage, TemplateStorage};
use crate::tick::TickLoop;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use thiserror::Error;
use tracing::{info, warn};

static GLOBAL: OnceLock<Arc<Node>> = OnceLock::new();

/// Ticks between resource snapshot broadcasts (5 s at 20 TPS).
const RESOURCE_REFRESH_TICKS: u64 = 100;

/// Node startup errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("I/O error during startup: {0}")]
    Io(#[from] std::io::Error),
}

/// The assembled node runtime.
pub struct Node {
    config: SharedConfig,
    paths: NodePaths,
    registry: Arc<ServiceRegistry>,
    events: Arc<EventBus>,
    tick: TickLoop,
    messenger: Arc<ChannelMessenger>,
    provider: Arc<NodeServerProvider>,
    sync: Arc<DataSyncRegistry>,
    manager: Arc<CloudServiceManager>,
    server: Arc<NetworkServer>,
    client: Arc<NetworkClient>,
    chunks: Arc<ChunkedSessionRegistry>,
    shutdown: Arc<ShutdownHandler>,
    bound_addresses: Vec<std::net::SocketAddr>,
}

impl Node {
    /// Builds and starts a node from the state directory: loads (or
    /// creates) the config, wires all subsystems, binds the acceptor and
    /// starts dialing the configured peers.
    pub async fn start(state_dir: PathBuf, node_name: &str) -> Result<Arc<Self>, NodeError> {
        let paths = NodePaths::new(state_dir);
        let config = ClusterConfig::load_or_create(&paths.config_file(), node_name)?;
        info!(
            node = %config.local_node.name,
            cluster = %config.cluster_id,
            "starting node"
        );
        let config: SharedConfig = Arc::new(RwLock::new(config));

        let registry = Arc::new(ServiceRegistry::new());
        let events = Arc::new(EventBus::new());
        let (tick, _tick_join) = TickLoop::start();
        let listeners = Arc::new(PacketListenerRegistry::new());
        let client = NetworkClient::new(Arc::clone(&listeners));
        let sync = Arc::new(DataSyncRegistry::new());

        let local_name = {
            let config = config.read().unwrap_or_else(|e| e.into_inner());
            config.local_node.name.clone()
        };
        let messenger = ChannelMessenger::new(local_name);

        let provider = NodeServerProvider::new(
            Arc::clone(&config),
            Arc::clone(&events),
            Arc::clone(&messenger),
            Arc::clone(&sync),
            Arc::clone(&client),
        );
        let manager = CloudServiceManager::new(
            Arc::clone(&registry),
            Arc::clone(&config),
            paths.clone(),
            Arc::clone(&provider),
            Arc::clone(&messenger),
            Arc::clone(&events),
        );

        register_default_services(&registry, &paths);
        wire_collaborators(&provider, &manager, &messenger);
        register_sync_handlers(&sync, &provider, &manager);
        register_bus_handlers(&messenger, &sync);
        manager.register_message_handlers();

        let chunks = Arc::new(ChunkedSessionRegistry::new(
            paths.temp_dir().to_path_buf(),
            Arc::clone(&events),
        ));
        register_packet_listeners(&listeners, &provider, &messenger, &chunks, &events);

        let server = NetworkServer::new(Arc::clone(&listeners));
        let listen_addresses = {
            let config = config.read().unwrap_or_else(|e| e.into_inner());
            config.local_node.listen_addresses.clone()
        };
        let mut bound_addresses = Vec::with_capacity(listen_addresses.len());
        for address in listen_addresses {
            bound_addresses.push(server.bind(address).await?);
        }

        if let Some(address) = bound_addresses.first() {
            manager.set_node_address(*address);
        }

        provider.start();
        manager.refresh_local_resources().await;

        let shutdown = ShutdownHandler::new(
            tick.clone(),
            Arc::clone(&provider),
            Arc::clone(&manager),
            Arc::clone(&server),
            Arc::clone(&client),
            Arc::clone(&registry),
            paths.clone(),
        );

        let node = Arc::new(Self {
            config,
            paths,
            registry,
            events,
            tick,
            messenger,
            provider,
            sync,
            manager,
            server,
            client,
            chunks,
            shutdown,
            bound_addresses,
        });
        node.schedule_resource_refresh();
        let _ = GLOBAL.set(Arc::clone(&node));
        Ok(node)
    }

    /// The process-wide node, if one was started.
    pub fn global() -> Option<Arc<Node>> {
        GLOBAL.get().cloned()
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn tick(&self) -> &TickLoop {
        &self.tick
    }

    pub fn messenger(&self) -> &Arc<ChannelMessenger> {
        &self.messenger
    }

    pub fn cluster(&self) -> &Arc<NodeServerProvider> {
        &self.provider
    }

    pub fn sync(&self) -> &Arc<DataSyncRegistry> {
        &self.sync
    }

    pub fn services(&self) -> &Arc<CloudServiceManager> {
        &self.manager
    }

    pub fn chunk_sessions(&self) -> &Arc<ChunkedSessionRegistry> {
        &self.chunks
    }

    pub fn shutdown_handler(&self) -> &Arc<ShutdownHandler> {
        &self.shutdown
    }

    /// Addresses the transport acceptor actually bound (relevant when the
    /// config asked for port 0).
    pub fn bound_addresses(&self) -> &[std::net::SocketAddr] {
        &self.bound_addresses
    }

    /// Reloads the cluster config from disk.
    pub fn reload_config(&self) -> Result<(), ConfigError> {
        let fresh = ClusterConfig::load_from(&self.paths.config_file())?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        info!("configuration reloaded");
        Ok(())
    }

    /// Blocks until Ctrl-C, then runs the shutdown sequence.
    pub async fn run_until_signal(self: &Arc<Self>) {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("signal handler unavailable, shutting down");
        }
        self.shutdown.shutdown().await;
    }

    /// Periodic resource broadcast driven by the tick loop. Reschedules
    /// itself while the loop is running.
    fn schedule_resource_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let tick = self.tick.clone();
        let at = tick.current_tick() + RESOURCE_REFRESH_TICKS;
        tick.schedule_at(at, move || {
            let Some(node) = weak.upgrade() else {
                return;
            };
            // Network work does not belong on the tick thread.
            let manager = Arc::clone(&node.manager);
            tokio::spawn(async move { manager.refresh_local_resources().await });
            node.schedule_resource_refresh();
        });
    }
}

fn register_default_services(registry: &Arc<ServiceRegistry>, paths: &NodePaths) {
    let storage = Arc::new(LocalTemplateStorage::new(paths.templates_dir()));
    let _ = registry.register::<dyn TemplateStorage>(LocalTemplateStorage::NAME, storage);

    let _ = registry.register::<dyn ServiceRunner>(ProcessRunner::NAME, Arc::new(ProcessRunner));

    let memory = Arc::new(MemoryDatabaseProvider::new());
    let _ = registry.register::<dyn DatabaseProvider>("memory", memory);
    let json_file = Arc::new(JsonFileDatabaseProvider::new(paths.database_dir()));
    let _ = json_file.init();
    if let Ok(registration) = registry.register::<dyn DatabaseProvider>("json-file", json_file) {
        let _ = registration.mark_as_default();
    }
}

fn wire_collaborators(
    provider: &Arc<NodeServerProvider>,
    manager: &Arc<CloudServiceManager>,
    messenger: &Arc<ChannelMessenger>,
) {
    let auth: Arc<dyn ServiceAuthenticator> = Arc::clone(manager) as _;
    let disconnect: Arc<dyn NodeDisconnectActions> = Arc::clone(manager) as _;
    provider.attach(Arc::downgrade(&auth), Arc::downgrade(&disconnect));

    let cluster_access: Arc<dyn ClusterChannelAccess> = Arc::clone(provider) as _;
    let service_access: Arc<dyn ServiceChannelAccess> = Arc::clone(manager) as _;
    messenger.attach(Arc::downgrade(&cluster_access), Arc::downgrade(&service_access));
}

fn register_sync_handlers(
    sync: &Arc<DataSyncRegistry>,
    provider: &Arc<NodeServerProvider>,
    manager: &Arc<CloudServiceManager>,
) {
    // Tasks and groups: disk-backed definitions, identical on every node.
    let tasks = Arc::clone(manager.task_store());
    let tasks_current = Arc::clone(&tasks);
    let tasks_write = Arc::clone(&tasks);
    sync.register(
        DataSyncHandler::<ServiceTask>::builder(keys::SERVICE_TASKS)
            .collector(move || tasks.load_all())
            .current_getter(move |candidate| {
                tasks_current.load(&candidate.name).ok().flatten()
            })
            .writer(move |task| {
                if let Err(error) = tasks_write.save(&task.name, &task) {
                    warn!(task = %task.name, %error, "task sync write failed");
                }
            })
            .name_extractor(|task| task.name.clone())
            .build(),
    );

    let groups = Arc::clone(manager.group_store());
    let groups_current = Arc::clone(&groups);
    let groups_write = Arc::clone(&groups);
    sync.register(
        DataSyncHandler::<GroupConfiguration>::builder(keys::GROUP_CONFIGURATIONS)
            .collector(move || groups.load_all())
            .current_getter(move |candidate| {
                groups_current.load(&candidate.name).ok().flatten()
            })
            .writer(move |group| {
                if let Err(error) = groups_write.save(&group.name, &group) {
                    warn!(group = %group.name, %error, "group sync write failed");
                }
            })
            .name_extractor(|group| group.name.clone())
            .build(),
    );

    // Service snapshots: freshest update wins.
    let snapshots_collect = Arc::downgrade(manager);
    let snapshots_current = Arc::downgrade(manager);
    let snapshots_write = Arc::downgrade(manager);
    sync.register(
        DataSyncHandler::<ServiceInfoSnapshot>::builder(keys::SERVICE_SNAPSHOTS)
            .always_force()
            .collector(move || {
                snapshots_collect
                    .upgrade()
                    .map(|m| m.known_snapshots())
                    .unwrap_or_default()
            })
            .current_getter(move |candidate| {
                snapshots_current
                    .upgrade()
                    .and_then(|m| m.known_snapshot_of(candidate.service_id.unique_id))
            })
            .writer(move |snapshot| {
                if let Some(manager) = snapshots_write.upgrade() {
                    manager.apply_replicated_snapshot(snapshot);
                }
            })
            .name_extractor(|snapshot| snapshot.service_id.unique_id.to_string())
            .build(),
    );

    // Node resources: freshest update wins as well.
    let resources_collect = Arc::downgrade(provider);
    let resources_current = Arc::downgrade(provider);
    let resources_write = Arc::downgrade(provider);
    let local_id = provider.local_identity().unique_id;
    sync.register(
        DataSyncHandler::<NodeResourceSnapshot>::builder(keys::NODE_RESOURCES)
            .always_force()
            .collector(move || {
                resources_collect
                    .upgrade()
                    .map(|p| {
                        let mut all = vec![p.local_resources()];
                        all.extend(p.peer_resource_snapshots());
                        all
                    })
                    .unwrap_or_default()
            })
            .current_getter(move |candidate| {
                let provider = resources_current.upgrade()?;
                if candidate.node_unique_id == local_id {
                    Some(provider.local_resources())
                } else {
                    provider
                        .node_server_by_id(candidate.node_unique_id)
                        .map(|n| n.resources)
                }
            })
            .writer(move |resources: NodeResourceSnapshot| {
                if resources.node_unique_id == local_id {
                    return;
                }
                if let Some(provider) = resources_write.upgrade() {
                    provider.apply_peer_resources(resources);
                }
            })
            .name_extractor(|resources| resources.node_unique_id.to_string())
            .build(),
    );
}

fn register_bus_handlers(messenger: &Arc<ChannelMessenger>, sync: &Arc<DataSyncRegistry>) {
    messenger.subscribe(
        INTERNAL_CHANNEL,
        Some("sync_data"),
        Arc::new(SyncDataHandler {
            sync: Arc::downgrade(sync),
        }),
    );
    messenger.subscribe(INTERNAL_CHANNEL, Some("head_changed"), Arc::new(HeadChangedHandler));
}

fn register_packet_listeners(
    listeners: &Arc<PacketListenerRegistry>,
    provider: &Arc<NodeServerProvider>,
    messenger: &Arc<ChannelMessenger>,
    chunks: &Arc<ChunkedSessionRegistry>,
    events: &Arc<EventBus>,
) {
    listeners.register(channels::AUTH, Arc::new(AuthPacketListener::new(provider)));
    listeners.register(channels::CHUNK, Arc::clone(chunks) as _);
    listeners.register(
        channels::CHANNEL_MESSAGE,
        Arc::new(ChannelMessageListener::new(messenger)),
    );
    listeners.register(
        channels::QUERY_RESPONSE,
        Arc::new(QueryResponseListener::new(messenger)),
    );
    listeners.register(
        channels::SERVICE_SYNC_ACK,
        Arc::new(SyncAckPacketListener::new(provider)),
    );
    listeners.register_close_listener(Arc::new(NodeChannelCloseListener::new(
        provider,
        Arc::clone(events),
    )));
}

/// Applies incremental sync records arriving as channel messages.
struct SyncDataHandler {
    sync: Weak<DataSyncRegistry>,
}

#[async_trait]
impl MessageHandler for SyncDataHandler {
    async fn handle(&self, message: &ChannelMessage, _context: &InboundContext) -> Option<Bytes> {
        let sync = self.sync.upgrade()?;
        let mut content = message.content.clone();
        let key = wire::get_string(&mut content).ok()?;
        let record = wire::get_bytes(&mut content).ok()?;
        if let Err(error) = sync.handle_incremental(&key, &record) {
            warn!(key = %key, %error, "incremental sync apply failed");
        }
        None
    }
}

struct HeadChangedHandler;

#[async_trait]
impl MessageHandler for HeadChangedHandler {
    async fn handle(&self, message: &ChannelMessage, _context: &InboundContext) -> Option<Bytes> {
        let head = String::from_utf8_lossy(&message.content).to_string();
        info!(head = %head, "cluster head announcement");
        None
    }
}

