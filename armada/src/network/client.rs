//! Outbound transport connector.

use super::channel::{spawn_channel_io, NetworkChannel};
use super::error::NetworkError;
use super::listener::{ChannelCloseListener, PacketListenerRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Opens transport channels to remote peers.
///
/// Open outbound channels are tracked so shutdown can close them in one
/// sweep; the per-peer reconnect policy lives with the cluster provider,
/// not here.
pub struct NetworkClient {
    listeners: Arc<PacketListenerRegistry>,
    open: Arc<DashMap<u64, Arc<NetworkChannel>>>,
}

impl NetworkClient {
    pub fn new(listeners: Arc<PacketListenerRegistry>) -> Arc<Self> {
        let client = Arc::new(Self {
            listeners,
            open: Arc::new(DashMap::new()),
        });
        client
            .listeners
            .register_close_listener(Arc::new(OpenChannelReaper {
                open: Arc::clone(&client.open),
            }));
        client
    }

    /// Connects to a peer and returns the unauthorized channel.
    pub async fn connect(&self, address: SocketAddr) -> Result<Arc<NetworkChannel>, NetworkError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| NetworkError::Connect { address, source })?;
        debug!(remote = %address, "transport connection established");

        let channel = spawn_channel_io(stream, Arc::clone(&self.listeners))?;
        self.open.insert(channel.id(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Closes every open outbound channel.
    pub async fn close(&self) {
        for entry in self.open.iter() {
            entry.close();
        }
        self.open.clear();
    }
}

struct OpenChannelReaper {
    open: Arc<DashMap<u64, Arc<NetworkChannel>>>,
}

#[async_trait]
impl ChannelCloseListener for OpenChannelReaper {
    async fn handle_close(&self, channel: &Arc<NetworkChannel>) {
        self.open.remove(&channel.id());
    }
}
