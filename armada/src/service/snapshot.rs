//! Service lifecycle and replicated snapshots.

use super::types::{ServiceConfiguration, ServiceId};
use crate::time::now_millis;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Lifecycle states of a service.
///
/// Transitions form a single line; anything off the line is an order
/// violation and must be answered with the current snapshot, unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceLifeCycle {
    Prepared,
    Starting,
    Running,
    Stopped,
    /// Tombstone: published to the cluster, then garbage-collected.
    Deleted,
}

impl ServiceLifeCycle {
    /// Whether the lifecycle may move from `self` to `next`.
    pub fn can_transition_to(self, next: ServiceLifeCycle) -> bool {
        use ServiceLifeCycle::*;
        matches!(
            (self, next),
            (Prepared, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Stopped, Starting)
                | (Stopped, Deleted)
        )
    }
}

impl std::fmt::Display for ServiceLifeCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Prepared => "PREPARED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Point-in-time resource usage of a service process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: Option<u32>,
    pub cpu_usage: f64,
    pub heap_usage_mib: u64,
    pub max_heap_mib: u64,
}

impl ProcessSnapshot {
    /// Snapshot of a process that is not running.
    pub fn empty() -> Self {
        Self {
            pid: None,
            cpu_usage: 0.0,
            heap_usage_mib: 0,
            max_heap_mib: 0,
        }
    }
}

/// Replicated view of one service. Last write wins per
/// `service_id.unique_id`; the owning node publishes updates in monotonic
/// lifecycle order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceInfoSnapshot {
    pub service_id: ServiceId,
    pub address: SocketAddr,
    pub process_snapshot: ProcessSnapshot,
    pub configuration: ServiceConfiguration,
    pub creation_time_ms: u64,
    /// Epoch millis when the agent channel bound; `-1` while unconnected.
    pub connected_time_ms: i64,
    pub life_cycle: ServiceLifeCycle,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ServiceInfoSnapshot {
    pub fn new(
        service_id: ServiceId,
        address: SocketAddr,
        configuration: ServiceConfiguration,
    ) -> Self {
        Self {
            service_id,
            address,
            process_snapshot: ProcessSnapshot::empty(),
            configuration,
            creation_time_ms: now_millis(),
            connected_time_ms: -1,
            life_cycle: ServiceLifeCycle::Prepared,
            properties: serde_json::Map::new(),
        }
    }

    pub fn name(&self) -> String {
        self.service_id.name()
    }

    /// Copy of this snapshot rewritten as a deletion tombstone with an
    /// empty process snapshot, as published when the owning node is lost.
    pub fn as_tombstone(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot.process_snapshot = ProcessSnapshot::empty();
        snapshot.connected_time_ms = -1;
        snapshot.life_cycle = ServiceLifeCycle::Deleted;
        snapshot
    }
}
