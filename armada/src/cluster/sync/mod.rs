//! Per-entity push/pull reconciliation of replicated cluster state.
//!
//! Each replicated entity kind registers a typed [`DataSyncHandler`]; the
//! registry erases them behind a common interface. On peer reconnect the
//! whole registry is serialized into a snapshot
//! ([`DataSyncRegistry::prepare_cluster_data`]) and applied on the other
//! side record by record, resolving conflicts per handler. After the
//! initial sync, individual changes travel as channel messages keyed by
//! handler id.

mod handler;

pub use handler::{DataSyncHandler, DataSyncHandlerBuilder};

/// Well-known sync handler keys of the node core.
pub mod keys {
    pub const SERVICE_TASKS: &str = "service_tasks";
    pub const GROUP_CONFIGURATIONS: &str = "group_configurations";
    pub const SERVICE_SNAPSHOTS: &str = "service_snapshots";
    pub const NODE_RESOURCES: &str = "node_resources";
}

use crate::network::{wire, NetworkError};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Data sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no sync handler registered for key {0}")]
    UnknownKey(String),

    #[error("record of handler {key} failed to deserialize: {source}")]
    MalformedRecord {
        key: String,
        source: serde_json::Error,
    },
}

/// What applying one record did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No matching local record existed; written immediately.
    Written,
    /// Conflict resolved towards the incoming record.
    Overwritten,
    /// Conflict resolved towards the local record; incoming discarded.
    Discarded,
}

/// Type-erased view of one registered handler.
pub trait ErasedSyncHandler: Send + Sync {
    fn key(&self) -> &str;

    /// Conflicts always resolve to the incoming record when set. Used for
    /// append-only-feel state where the freshest update wins.
    fn always_force_apply(&self) -> bool;

    /// Serializes every current local record.
    fn collect_serialized(&self) -> Vec<Bytes>;

    /// Deserializes and applies one record, resolving conflicts.
    fn apply_serialized(&self, record: &[u8], force: bool) -> Result<SyncOutcome, SyncError>;
}

/// Serialized snapshot of all replicated entities, exchanged on reconnect.
#[derive(Clone, Debug, Default)]
pub struct ClusterSyncData {
    /// Conflicts resolve to incoming records regardless of handler policy.
    pub force: bool,
    pub entries: Vec<(String, Vec<Bytes>)>,
}

impl ClusterSyncData {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_bool(&mut buf, self.force);
        wire::put_var_u64(&mut buf, self.entries.len() as u64);
        for (key, records) in &self.entries {
            wire::put_string(&mut buf, key);
            wire::put_var_u64(&mut buf, records.len() as u64);
            for record in records {
                wire::put_bytes(&mut buf, record);
            }
        }
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, NetworkError> {
        let mut buf = payload.clone();
        let force = wire::get_bool(&mut buf)?;
        let entry_count = wire::get_var_u64(&mut buf)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let key = wire::get_string(&mut buf)?;
            let record_count = wire::get_var_u64(&mut buf)? as usize;
            let mut records = Vec::with_capacity(record_count);
            for _ in 0..record_count {
                records.push(wire::get_bytes(&mut buf)?);
            }
            entries.push((key, records));
        }
        Ok(Self { force, entries })
    }
}

/// Registry of all replicated entity kinds of a node.
#[derive(Default)]
pub struct DataSyncRegistry {
    handlers: RwLock<BTreeMap<String, Arc<dyn ErasedSyncHandler>>>,
}

impl DataSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its key, replacing a previous one.
    pub fn register(&self, handler: Arc<dyn ErasedSyncHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(handler.key().to_string(), handler);
    }

    pub fn unregister(&self, key: &str) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(key);
    }

    /// Serializes the current local state of every handler, emitted to a
    /// reconnecting peer as the authoritative snapshot.
    pub fn prepare_cluster_data(&self, force: bool) -> ClusterSyncData {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let entries = handlers
            .values()
            .map(|handler| (handler.key().to_string(), handler.collect_serialized()))
            .collect();
        ClusterSyncData { force, entries }
    }

    /// Applies a received snapshot record by record. Unknown keys and
    /// malformed records are logged and skipped; the remaining data still
    /// applies.
    pub fn apply_cluster_data(&self, data: &ClusterSyncData) {
        for (key, records) in &data.entries {
            let handler = {
                let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
                handlers.get(key).cloned()
            };
            let Some(handler) = handler else {
                warn!(key = %key, "dropping sync data without handler");
                continue;
            };
            let mut applied = 0usize;
            for record in records {
                match handler.apply_serialized(record, data.force) {
                    Ok(outcome) => {
                        if outcome != SyncOutcome::Discarded {
                            applied += 1;
                        }
                    }
                    Err(error) => warn!(key = %key, %error, "skipping malformed sync record"),
                }
            }
            debug!(key = %key, total = records.len(), applied, "applied sync data");
        }
    }

    /// Applies one incremental record received as a channel message. The
    /// incoming record wins - incremental propagation is last-write-wins.
    pub fn handle_incremental(&self, key: &str, record: &[u8]) -> Result<SyncOutcome, SyncError> {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(key).cloned()
        };
        match handler {
            Some(handler) => handler.apply_serialized(record, true),
            None => Err(SyncError::UnknownKey(key.to_string())),
        }
    }

    pub fn registered_keys(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        version: u32,
    }

    fn handler(
        key: &str,
        always_force: bool,
        store: Arc<Mutex<HashMap<String, Record>>>,
    ) -> Arc<dyn ErasedSyncHandler> {
        let collect_store = Arc::clone(&store);
        let current_store = Arc::clone(&store);
        let write_store = Arc::clone(&store);
        let mut builder = DataSyncHandler::<Record>::builder(key)
            .collector(move || collect_store.lock().unwrap().values().cloned().collect())
            .current_getter(move |candidate| {
                current_store.lock().unwrap().get(&candidate.name).cloned()
            })
            .writer(move |record| {
                write_store
                    .lock()
                    .unwrap()
                    .insert(record.name.clone(), record);
            })
            .name_extractor(|record| record.name.clone())
            .resolver(|local, incoming| incoming.version > local.version);
        if always_force {
            builder = builder.always_force();
        }
        builder.build()
    }

    #[test]
    fn test_snapshot_roundtrip_and_apply() {
        let source = Arc::new(Mutex::new(HashMap::new()));
        source.lock().unwrap().insert(
            "lobby".to_string(),
            Record {
                name: "lobby".to_string(),
                version: 2,
            },
        );
        let source_registry = DataSyncRegistry::new();
        source_registry.register(handler("tasks", false, source));

        let data = source_registry.prepare_cluster_data(true);
        let decoded = ClusterSyncData::decode(&data.encode()).unwrap();

        let target = Arc::new(Mutex::new(HashMap::new()));
        let target_registry = DataSyncRegistry::new();
        target_registry.register(handler("tasks", false, Arc::clone(&target)));
        target_registry.apply_cluster_data(&decoded);

        assert_eq!(
            target.lock().unwrap().get("lobby"),
            Some(&Record {
                name: "lobby".to_string(),
                version: 2
            })
        );
    }

    #[test]
    fn test_resolver_keeps_newer_local_record() {
        let store = Arc::new(Mutex::new(HashMap::new()));
        store.lock().unwrap().insert(
            "lobby".to_string(),
            Record {
                name: "lobby".to_string(),
                version: 5,
            },
        );
        let registry = DataSyncRegistry::new();
        registry.register(handler("tasks", false, Arc::clone(&store)));

        let stale = serde_json::to_vec(&Record {
            name: "lobby".to_string(),
            version: 1,
        })
        .unwrap();
        let outcome = registry.handlers.read().unwrap()["tasks"]
            .apply_serialized(&stale, false)
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Discarded);
        assert_eq!(store.lock().unwrap()["lobby"].version, 5);
    }

    #[test]
    fn test_always_force_overwrites() {
        let store = Arc::new(Mutex::new(HashMap::new()));
        store.lock().unwrap().insert(
            "lobby".to_string(),
            Record {
                name: "lobby".to_string(),
                version: 5,
            },
        );
        let registry = DataSyncRegistry::new();
        registry.register(handler("snapshots", true, Arc::clone(&store)));

        let stale = serde_json::to_vec(&Record {
            name: "lobby".to_string(),
            version: 1,
        })
        .unwrap();
        let outcome = registry.handle_incremental("snapshots", &stale).unwrap();

        assert_eq!(outcome, SyncOutcome::Overwritten);
        assert_eq!(store.lock().unwrap()["lobby"].version, 1);
    }

    #[test]
    fn test_unknown_key_is_reported() {
        let registry = DataSyncRegistry::new();
        let result = registry.handle_incremental("nope", b"{}");
        assert!(matches!(result, Err(SyncError::UnknownKey(_))));
    }
}
