//! Authorization handshake frames (wire channel 0).

use crate::config::NodeIdentity;
use crate::network::{wire, NetworkError};
use crate::service::types::{ServiceEnvironment, ServiceId};
use bytes::{Bytes, BytesMut};

const AUTH_NODE_TO_NODE: u8 = 0;
const AUTH_SERVICE_TO_NODE: u8 = 1;

/// First frame on a fresh connection: `[byte type][data]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthRequest {
    /// A cluster peer authenticating with the shared cluster id.
    NodeToNode {
        cluster_id: uuid::Uuid,
        identity: NodeIdentity,
    },
    /// A service agent authenticating with its per-service secret.
    ServiceToNode {
        connection_key: String,
        service_id: ServiceId,
    },
}

impl AuthRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::NodeToNode {
                cluster_id,
                identity,
            } => {
                buf.extend_from_slice(&[AUTH_NODE_TO_NODE]);
                wire::put_uuid(&mut buf, cluster_id);
                put_identity(&mut buf, identity);
            }
            Self::ServiceToNode {
                connection_key,
                service_id,
            } => {
                buf.extend_from_slice(&[AUTH_SERVICE_TO_NODE]);
                wire::put_string(&mut buf, connection_key);
                put_service_id(&mut buf, service_id);
            }
        }
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, NetworkError> {
        let mut buf = payload.clone();
        match wire::get_var_u64(&mut buf)? as u8 {
            AUTH_NODE_TO_NODE => Ok(Self::NodeToNode {
                cluster_id: wire::get_uuid(&mut buf)?,
                identity: get_identity(&mut buf)?,
            }),
            AUTH_SERVICE_TO_NODE => Ok(Self::ServiceToNode {
                connection_key: wire::get_string(&mut buf)?,
                service_id: get_service_id(&mut buf)?,
            }),
            other => Err(NetworkError::Decode(format!("unknown auth type {other}"))),
        }
    }
}

/// Handshake answer: `[bool success][bool initialSync][optional snapshot]`.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthResponse {
    pub success: bool,
    /// When set, `snapshot` carries the authoritative cluster data and the
    /// initiator must acknowledge on the sync-ack channel.
    pub initial_sync: bool,
    pub snapshot: Option<Bytes>,
}

impl AuthResponse {
    pub fn denied() -> Self {
        Self {
            success: false,
            initial_sync: false,
            snapshot: None,
        }
    }

    pub fn accepted() -> Self {
        Self {
            success: true,
            initial_sync: false,
            snapshot: None,
        }
    }

    pub fn accepted_with_sync(snapshot: Bytes) -> Self {
        Self {
            success: true,
            initial_sync: true,
            snapshot: Some(snapshot),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_bool(&mut buf, self.success);
        wire::put_bool(&mut buf, self.initial_sync);
        match &self.snapshot {
            Some(snapshot) => {
                wire::put_bool(&mut buf, true);
                wire::put_bytes(&mut buf, snapshot);
            }
            None => wire::put_bool(&mut buf, false),
        }
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, NetworkError> {
        let mut buf = payload.clone();
        let success = wire::get_bool(&mut buf)?;
        let initial_sync = wire::get_bool(&mut buf)?;
        let snapshot = if wire::get_bool(&mut buf)? {
            Some(wire::get_bytes(&mut buf)?)
        } else {
            None
        };
        Ok(Self {
            success,
            initial_sync,
            snapshot,
        })
    }
}

fn put_identity(buf: &mut BytesMut, identity: &NodeIdentity) {
    wire::put_uuid(buf, &identity.unique_id);
    wire::put_string(buf, &identity.name);
    wire::put_var_u64(buf, identity.listen_addresses.len() as u64);
    for address in &identity.listen_addresses {
        wire::put_string(buf, &address.to_string());
    }
}

fn get_identity(buf: &mut Bytes) -> Result<NodeIdentity, NetworkError> {
    let unique_id = wire::get_uuid(buf)?;
    let name = wire::get_string(buf)?;
    let count = wire::get_var_u64(buf)? as usize;
    let mut listen_addresses = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = wire::get_string(buf)?;
        let address = raw
            .parse()
            .map_err(|_| NetworkError::Decode(format!("invalid listen address {raw}")))?;
        listen_addresses.push(address);
    }
    Ok(NodeIdentity {
        unique_id,
        name,
        listen_addresses,
    })
}

fn put_service_id(buf: &mut BytesMut, id: &ServiceId) {
    wire::put_uuid(buf, &id.unique_id);
    wire::put_string(buf, &id.task_name);
    wire::put_var_u64(buf, id.name_suffix as u64);
    wire::put_uuid(buf, &id.node_unique_id);
    wire::put_string(buf, &id.environment.to_string());
}

fn get_service_id(buf: &mut Bytes) -> Result<ServiceId, NetworkError> {
    let unique_id = wire::get_uuid(buf)?;
    let task_name = wire::get_string(buf)?;
    let name_suffix = wire::get_var_u64(buf)? as u32;
    let node_unique_id = wire::get_uuid(buf)?;
    let environment = match wire::get_string(buf)?.as_str() {
        "game-server" => ServiceEnvironment::GameServer,
        "proxy" => ServiceEnvironment::Proxy,
        "generic" => ServiceEnvironment::Generic,
        other => {
            return Err(NetworkError::Decode(format!(
                "unknown service environment {other}"
            )))
        }
    };
    Ok(ServiceId {
        unique_id,
        task_name,
        name_suffix,
        node_unique_id,
        environment,
    })
}
