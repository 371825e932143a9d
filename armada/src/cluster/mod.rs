//! Cluster membership, head election and authoritative data sync.

pub mod sync;

mod auth;
mod node_server;
mod provider;

pub use auth::{AuthRequest, AuthResponse};
pub use node_server::{NodeResourceSnapshot, NodeServer, NodeServerState, NodeServerView};
pub use provider::{
    AuthPacketListener, NodeChannelCloseListener, NodeDisconnectActions, NodeServerProvider,
    ServiceAuthenticator, SyncAckPacketListener,
};
