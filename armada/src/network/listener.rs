//! Packet listener table keyed by wire channel id.

use super::channel::NetworkChannel;
use super::packet::Packet;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Handles inbound packets on one wire channel id.
///
/// Listeners run on the connection's reader task, so per-channel dispatch
/// order matches arrival order. Long-running work must be spawned.
#[async_trait]
pub trait PacketListener: Send + Sync {
    async fn handle(&self, channel: &Arc<NetworkChannel>, packet: Packet);
}

/// Notified when a transport channel closes, after its reader wound down.
#[async_trait]
pub trait ChannelCloseListener: Send + Sync {
    async fn handle_close(&self, channel: &Arc<NetworkChannel>);
}

/// Listener table shared by all connections of a node.
#[derive(Default)]
pub struct PacketListenerRegistry {
    listeners: DashMap<u32, Vec<Arc<dyn PacketListener>>>,
    close_listeners: RwLock<Vec<Arc<dyn ChannelCloseListener>>>,
}

impl PacketListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener for a wire channel id. Multiple listeners on the
    /// same id are dispatched in registration order.
    pub fn register(&self, wire_channel: u32, listener: Arc<dyn PacketListener>) {
        self.listeners.entry(wire_channel).or_default().push(listener);
    }

    /// Removes all listeners of a wire channel id.
    pub fn remove_listeners(&self, wire_channel: u32) {
        self.listeners.remove(&wire_channel);
    }

    pub fn register_close_listener(&self, listener: Arc<dyn ChannelCloseListener>) {
        self.close_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub(crate) async fn dispatch(&self, channel: &Arc<NetworkChannel>, packet: Packet) {
        let targets = self
            .listeners
            .get(&packet.channel)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        if targets.is_empty() {
            trace!(wire_channel = packet.channel, "no listener for packet");
            return;
        }
        for listener in targets {
            listener.handle(channel, packet.clone()).await;
        }
    }

    pub(crate) async fn handle_close(&self, channel: &Arc<NetworkChannel>) {
        let targets: Vec<_> = self
            .close_listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in targets {
            listener.handle_close(channel).await;
        }
    }
}
