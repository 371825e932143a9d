//! Ordered graceful shutdown.

use crate::cluster::NodeServerProvider;
use crate::config::NodePaths;
use crate::database::DatabaseProvider;
use crate::network::{NetworkClient, NetworkServer};
use crate::registry::{OwnerId, ServiceRegistry};
use crate::service::CloudServiceManager;
use crate::tick::TickLoop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

type ConsoleCloseHook = Box<dyn FnOnce() + Send>;

/// Sequences the node shutdown. Each step waits for the previous one;
/// the whole sequence runs at most once - later calls are no-ops.
pub struct ShutdownHandler {
    triggered: AtomicBool,
    tick: TickLoop,
    provider: Arc<NodeServerProvider>,
    manager: Arc<CloudServiceManager>,
    server: Arc<NetworkServer>,
    client: Arc<NetworkClient>,
    registry: Arc<ServiceRegistry>,
    plugin_owners: Mutex<Vec<OwnerId>>,
    paths: NodePaths,
    console_close: Mutex<Option<ConsoleCloseHook>>,
}

impl ShutdownHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tick: TickLoop,
        provider: Arc<NodeServerProvider>,
        manager: Arc<CloudServiceManager>,
        server: Arc<NetworkServer>,
        client: Arc<NetworkClient>,
        registry: Arc<ServiceRegistry>,
        paths: NodePaths,
    ) -> Arc<Self> {
        Arc::new(Self {
            triggered: AtomicBool::new(false),
            tick,
            provider,
            manager,
            server,
            client,
            registry,
            plugin_owners: Mutex::new(Vec::new()),
            paths,
            console_close: Mutex::new(None),
        })
    }

    /// Registers a plug-in owner whose registrations are dropped during
    /// shutdown.
    pub fn track_plugin_owner(&self, owner: OwnerId) {
        self.plugin_owners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(owner);
    }

    /// Installs the hook closing the terminal as the final step.
    pub fn set_console_close(&self, hook: ConsoleCloseHook) {
        *self.console_close.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub fn was_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Runs the shutdown sequence. Returns false when another call
    /// already ran it.
    pub async fn shutdown(&self) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("stopping node");

        // 1. Stop the tick loop; timed work dies with it.
        self.tick.stop();

        // 2. Drain and interrupt the connections to other nodes.
        info!("closing node connections");
        self.provider.close().await;

        // 3. Stop all local services, best effort.
        info!("stopping services");
        self.manager.stop_all_services().await;

        // 4. Close the acceptor and client transports.
        info!("closing network components");
        self.server.close().await;
        self.client.close().await;

        // 5. Close data stores.
        info!("closing providers");
        for registration in self.registry.registrations::<dyn DatabaseProvider>() {
            if let Err(err) = registration.instance().close() {
                error!(provider = registration.name(), %err, "database close failed");
            }
        }

        // 6. Unload plug-ins.
        let owners: Vec<OwnerId> = self
            .plugin_owners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for owner in owners {
            self.registry.unregister_all_by_owner(&owner);
        }

        // 7. Delete the per-process temp directory.
        info!("deleting temp directory");
        if let Err(err) = self.paths.delete_temp_dir() {
            error!(%err, "temp directory cleanup failed");
        }

        // 8. Close the terminal.
        if let Some(hook) = self
            .console_close
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            hook();
        }

        info!("node stopped");
        true
    }
}
