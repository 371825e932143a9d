//! TCP acceptor for inbound node and service-agent connections.

use super::channel::{spawn_channel_io, NetworkChannel};
use super::error::NetworkError;
use super::listener::{ChannelCloseListener, PacketListenerRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts transport connections on one or more listen addresses.
///
/// Accepted channels start unauthorized; the auth packet listener decides
/// their fate. All open inbound channels are tracked so shutdown can close
/// them in one sweep.
pub struct NetworkServer {
    listeners: Arc<PacketListenerRegistry>,
    open: Arc<DashMap<u64, Arc<NetworkChannel>>>,
    shutdown: CancellationToken,
    accept_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl NetworkServer {
    pub fn new(listeners: Arc<PacketListenerRegistry>) -> Arc<Self> {
        let server = Arc::new(Self {
            listeners,
            open: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            accept_tasks: Mutex::new(Vec::new()),
        });

        // Drop closed channels from the tracking table.
        server
            .listeners
            .register_close_listener(Arc::new(OpenChannelReaper {
                open: Arc::clone(&server.open),
            }));
        server
    }

    /// Binds a listen address and starts accepting on it. Returns the
    /// actually bound address (relevant when binding port 0).
    pub async fn bind(self: &Arc<Self>, address: SocketAddr) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| NetworkError::Bind { address, source })?;
        let bound = listener.local_addr().unwrap_or(address);
        info!(address = %bound, "listening for transport connections");

        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    _ = server.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "accepted transport connection");
                        match spawn_channel_io(stream, Arc::clone(&server.listeners)) {
                            Ok(channel) => {
                                server.open.insert(channel.id(), channel);
                            }
                            Err(error) => {
                                warn!(%remote, %error, "failed to set up channel");
                            }
                        }
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                    }
                }
            }
        });
        self.accept_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
        Ok(bound)
    }

    /// Currently open inbound channels.
    pub fn channels(&self) -> Vec<Arc<NetworkChannel>> {
        self.open.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Stops accepting and closes every open inbound channel.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self
            .accept_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
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
