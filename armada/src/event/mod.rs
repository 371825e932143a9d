//! In-process event bus.
//!
//! Subsystems emit structured events via the bus without knowing how they
//! are consumed - this follows the "emit, don't present" pattern. Consumers
//! (log forwarders, modules, the CLI) register listeners and decide how to
//! present or aggregate events.

use crate::service::snapshot::{ServiceInfoSnapshot, ServiceLifeCycle};
use std::net::SocketAddr;
use std::sync::RwLock;
use uuid::Uuid;

/// Events emitted by the node subsystems.
///
/// Events are fire-and-forget: a panicking or slow listener must not take
/// down the emitting subsystem, so dispatch never propagates errors.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A cluster peer completed the authorization handshake.
    NodeAuthSuccess { node_name: String },

    /// A previously disconnected cluster peer reconnected and is syncing.
    NodeReconnect { node_name: String },

    /// A cluster peer's transport channel closed.
    NodeDisconnected { node_name: String },

    /// The elected cluster head changed.
    HeadChanged { head_name: String },

    /// A network channel closed before or after authorization.
    NetworkChannelClose { remote: SocketAddr },

    /// A chunked transfer session was opened by a remote peer.
    ChunkedSessionOpen {
        session_id: Uuid,
        transfer_channel: String,
    },

    /// A service agent authenticated on its channel.
    ServiceAuthSuccess { service_name: String },

    /// A service transitioned between lifecycle states.
    ServiceLifecycleChange {
        previous: ServiceLifeCycle,
        snapshot: ServiceInfoSnapshot,
    },

    /// A service wrote a line to its console.
    ServiceLogEntry {
        service_name: String,
        line: String,
    },
}

/// Listener for node events.
pub trait EventListener: Send + Sync {
    fn handle_event(&self, event: &NodeEvent);
}

impl<F> EventListener for F
where
    F: Fn(&NodeEvent) + Send + Sync,
{
    fn handle_event(&self, event: &NodeEvent) {
        self(event)
    }
}

/// Dispatches [`NodeEvent`]s to registered listeners in registration order.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Box<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Listeners are invoked in registration order.
    pub fn register<L: EventListener + 'static>(&self, listener: L) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(Box::new(listener));
    }

    /// Publishes an event to all listeners.
    pub fn publish(&self, event: NodeEvent) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener.handle_event(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .listeners
            .read()
            .map(|l| l.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_listener_receives_event() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        bus.register(move |_event: &NodeEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(NodeEvent::NodeAuthSuccess {
            node_name: "node-1".to_string(),
        });
        bus.publish(NodeEvent::NodeDisconnected {
            node_name: "node-1".to_string(),
        });

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listeners_invoked_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(RwLock::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.register(move |_event: &NodeEvent| {
                order.write().unwrap().push(tag);
            });
        }

        bus.publish(NodeEvent::HeadChanged {
            head_name: "node-1".to_string(),
        });

        assert_eq!(*order.read().unwrap(), vec!["first", "second", "third"]);
    }
}
