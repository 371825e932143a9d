//! Cluster roster entries.

use crate::config::NodeIdentity;
use crate::network::NetworkChannel;
use crate::time::now_millis;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Connection state of one roster entry.
///
/// `Unavailable -> Connected -> Syncing -> Ready <-> Disconnected`; only
/// the local node or a READY peer may be chosen as a placement target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeServerState {
    Unavailable,
    Connected,
    Syncing,
    Ready,
    Disconnected,
}

/// Resource usage advertised by a node, used for placement scoring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeResourceSnapshot {
    pub node_name: String,
    pub node_unique_id: Uuid,
    pub max_memory_mib: u64,
    pub used_memory_mib: u64,
    pub service_count: u32,
    pub cpu_load: f64,
    pub drain: bool,
    pub timestamp_ms: u64,
}

impl NodeResourceSnapshot {
    pub fn empty(identity: &NodeIdentity, max_memory_mib: u64) -> Self {
        Self {
            node_name: identity.name.clone(),
            node_unique_id: identity.unique_id,
            max_memory_mib,
            used_memory_mib: 0,
            service_count: 0,
            cpu_load: 0.0,
            drain: false,
            timestamp_ms: now_millis(),
        }
    }

    /// Weighted load in `[0, +inf)`; lower places better.
    pub fn load_factor(&self) -> f64 {
        let memory = if self.max_memory_mib == 0 {
            1.0
        } else {
            self.used_memory_mib as f64 / self.max_memory_mib as f64
        };
        memory + self.service_count as f64 * 0.01 + self.cpu_load / 100.0
    }
}

/// One peer entry in the cluster roster.
pub struct NodeServer {
    pub identity: NodeIdentity,
    pub state: NodeServerState,
    pub channel: Option<Arc<NetworkChannel>>,
    pub last_state_change_ms: u64,
    pub head: bool,
    pub drain: bool,
    pub resources: NodeResourceSnapshot,
}

impl NodeServer {
    pub fn new(identity: NodeIdentity) -> Self {
        let resources = NodeResourceSnapshot::empty(&identity, 0);
        Self {
            identity,
            state: NodeServerState::Unavailable,
            channel: None,
            last_state_change_ms: now_millis(),
            head: false,
            drain: false,
            resources,
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn available(&self) -> bool {
        self.state == NodeServerState::Ready
    }

    pub(crate) fn change_state(&mut self, state: NodeServerState) {
        if self.state != state {
            self.state = state;
            self.last_state_change_ms = now_millis();
        }
    }
}

/// Read-only copy of a roster entry handed out of the provider.
#[derive(Clone, Debug)]
pub struct NodeServerView {
    pub identity: NodeIdentity,
    pub state: NodeServerState,
    pub head: bool,
    pub drain: bool,
    pub last_state_change_ms: u64,
    pub resources: NodeResourceSnapshot,
}

impl NodeServerView {
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn available(&self) -> bool {
        self.state == NodeServerState::Ready
    }
}
