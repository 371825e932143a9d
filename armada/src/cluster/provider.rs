//! Cluster roster, head election and the authorization handshake.

use super::auth::{AuthRequest, AuthResponse};
use super::node_server::{NodeResourceSnapshot, NodeServer, NodeServerState, NodeServerView};
use super::sync::{ClusterSyncData, DataSyncRegistry};
use crate::config::{NodeIdentity, SharedConfig};
use crate::event::{EventBus, NodeEvent};
use crate::messaging::{
    ChannelMessage, ChannelMessageTarget, ChannelMessenger, ClusterChannelAccess, INTERNAL_CHANNEL,
};
use crate::network::{
    channels, ChannelAttachment, ChannelCloseListener, NetworkChannel, NetworkClient, Packet,
    PacketListener,
};
use crate::service::types::ServiceId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reconnect backoff bounds: 1 s doubling up to 30 s.
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Window the initiator waits for the handshake answer.
const AUTH_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Packet id used to correlate the handshake answer on the initiator side.
const AUTH_PACKET_ID: u64 = 1;

struct NodeSlot {
    generation: u64,
    server: NodeServer,
}

/// Rewrites services of a lost node; implemented by the service manager.
#[async_trait]
pub trait NodeDisconnectActions: Send + Sync {
    async fn handle_node_disconnect(&self, node_unique_id: Uuid, node_name: &str);
}

/// Binds service agent channels; implemented by the service manager.
#[async_trait]
pub trait ServiceAuthenticator: Send + Sync {
    /// Returns true when `connection_key` matches the addressed local
    /// service and the channel was bound to it.
    async fn authenticate_agent(
        &self,
        connection_key: &str,
        service_id: &ServiceId,
        channel: &Arc<NetworkChannel>,
    ) -> bool;
}

/// Owns the cluster roster of this node.
///
/// Each configured peer occupies a slot; transport channels reference
/// their peer as `(slot, generation)` so a stale close callback can be
/// detected instead of acting on a reused slot.
pub struct NodeServerProvider {
    config: SharedConfig,
    local: NodeIdentity,
    slots: RwLock<Vec<NodeSlot>>,
    head_name: RwLock<String>,
    local_resources: RwLock<NodeResourceSnapshot>,
    local_drain: AtomicBool,
    events: Arc<EventBus>,
    messenger: Arc<ChannelMessenger>,
    sync: Arc<DataSyncRegistry>,
    client: Arc<NetworkClient>,
    pending_auth: DashMap<u64, oneshot::Sender<AuthResponse>>,
    service_auth: OnceLock<Weak<dyn ServiceAuthenticator>>,
    disconnect_actions: OnceLock<Weak<dyn NodeDisconnectActions>>,
    shutdown: CancellationToken,
}

impl NodeServerProvider {
    pub fn new(
        config: SharedConfig,
        events: Arc<EventBus>,
        messenger: Arc<ChannelMessenger>,
        sync: Arc<DataSyncRegistry>,
        client: Arc<NetworkClient>,
    ) -> Arc<Self> {
        let (local, remotes, max_memory) = {
            let config = config.read().unwrap_or_else(|e| e.into_inner());
            (
                config.local_node.clone(),
                config.remote_nodes.clone(),
                config.max_memory_mib,
            )
        };

        let slots = remotes
            .into_iter()
            .map(|identity| NodeSlot {
                generation: 0,
                server: NodeServer::new(identity),
            })
            .collect();

        let local_resources = NodeResourceSnapshot::empty(&local, max_memory);
        let provider = Arc::new(Self {
            config,
            head_name: RwLock::new(local.name.clone()),
            local,
            slots: RwLock::new(slots),
            local_resources: RwLock::new(local_resources),
            local_drain: AtomicBool::new(false),
            events,
            messenger,
            sync,
            client,
            pending_auth: DashMap::new(),
            service_auth: OnceLock::new(),
            disconnect_actions: OnceLock::new(),
            shutdown: CancellationToken::new(),
        });
        provider.recompute_head();
        provider
    }

    /// Late-binds the service manager hooks; called during node wiring.
    pub fn attach(
        &self,
        service_auth: Weak<dyn ServiceAuthenticator>,
        disconnect_actions: Weak<dyn NodeDisconnectActions>,
    ) {
        let _ = self.service_auth.set(service_auth);
        let _ = self.disconnect_actions.set(disconnect_actions);
    }

    pub fn local_identity(&self) -> &NodeIdentity {
        &self.local
    }

    pub fn local_drain(&self) -> bool {
        self.local_drain.load(Ordering::SeqCst)
    }

    /// Marks this node as draining: it stops being a placement target and
    /// stops reconnecting to peers.
    pub fn set_local_drain(&self, drain: bool) {
        self.local_drain.store(drain, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Roster access
    // ------------------------------------------------------------------

    pub fn node_servers(&self) -> Vec<NodeServerView> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.iter().map(|slot| view_of(&slot.server)).collect()
    }

    pub fn node_server_by_name(&self, name: &str) -> Option<NodeServerView> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .find(|slot| slot.server.name() == name)
            .map(|slot| view_of(&slot.server))
    }

    pub fn node_server_by_id(&self, unique_id: Uuid) -> Option<NodeServerView> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .find(|slot| slot.server.identity.unique_id == unique_id)
            .map(|slot| view_of(&slot.server))
    }

    /// Name of the current cluster head.
    pub fn head_name(&self) -> String {
        self.head_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_head_local(&self) -> bool {
        self.head_name() == self.local.name
    }

    /// Placement candidates: the local node plus every READY peer, all
    /// excluding drained ones.
    pub fn placement_candidates(&self) -> Vec<NodeResourceSnapshot> {
        let mut candidates = Vec::new();
        if !self.local_drain() {
            candidates.push(self.local_resources());
        }
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter() {
            if slot.server.available() && !slot.server.drain {
                candidates.push(slot.server.resources.clone());
            }
        }
        candidates
    }

    pub fn local_resources(&self) -> NodeResourceSnapshot {
        self.local_resources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Refreshes the advertised resource usage of the local node.
    pub fn set_local_resources(&self, resources: NodeResourceSnapshot) {
        *self
            .local_resources
            .write()
            .unwrap_or_else(|e| e.into_inner()) = resources;
    }

    /// Applies a peer's replicated resource snapshot.
    pub fn apply_peer_resources(&self, resources: NodeResourceSnapshot) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots
            .iter_mut()
            .find(|slot| slot.server.identity.unique_id == resources.node_unique_id)
        {
            slot.server.drain = resources.drain;
            slot.server.resources = resources;
        }
    }

    /// All peer resource snapshots, replicated to other nodes.
    pub fn peer_resource_snapshots(&self) -> Vec<NodeResourceSnapshot> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .map(|slot| slot.server.resources.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Head election
    // ------------------------------------------------------------------

    /// Deterministic election without voting: among the local node and all
    /// READY peers, the smallest unique id wins. Returns the new head name
    /// when it changed.
    fn recompute_head(&self) -> Option<String> {
        let mut head = (self.local.unique_id, self.local.name.clone());
        {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            for slot in slots.iter() {
                if slot.server.available() && slot.server.identity.unique_id < head.0 {
                    head = (
                        slot.server.identity.unique_id,
                        slot.server.name().to_string(),
                    );
                }
            }
        }

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter_mut() {
            slot.server.head = slot.server.name() == head.1;
        }
        drop(slots);

        let mut current = self.head_name.write().unwrap_or_else(|e| e.into_inner());
        if *current != head.1 {
            *current = head.1.clone();
            Some(head.1)
        } else {
            None
        }
    }

    async fn announce_head_change(self: &Arc<Self>, head: String) {
        info!(head = %head, "cluster head changed");
        self.events.publish(NodeEvent::HeadChanged {
            head_name: head.clone(),
        });
        let message = ChannelMessage::builder()
            .target(ChannelMessageTarget::All)
            .channel(INTERNAL_CHANNEL)
            .message("head_changed")
            .content(Bytes::from(head.into_bytes()))
            .build();
        self.messenger.send(message).await;
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawns the reconnect loop for every configured peer.
    pub fn start(self: &Arc<Self>) {
        let slot_count = {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            slots.len()
        };
        for slot_index in 0..slot_count {
            let provider = Arc::clone(self);
            tokio::spawn(async move { provider.reconnect_loop(slot_index).await });
        }
    }

    /// Marks the local node as draining and closes every peer channel.
    pub async fn close(&self) {
        self.set_local_drain(true);
        self.shutdown.cancel();
        let channels: Vec<_> = {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            slots
                .iter()
                .filter_map(|slot| slot.server.channel.clone())
                .collect()
        };
        for channel in channels {
            channel.close();
        }
    }

    async fn reconnect_loop(self: Arc<Self>, slot_index: usize) {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        loop {
            if self.shutdown.is_cancelled() || self.local_drain() {
                return;
            }

            match self.establish(slot_index).await {
                Ok(channel) => {
                    backoff = RECONNECT_BACKOFF_MIN;
                    channel.closed().await;
                }
                Err(crate::network::NetworkError::AuthRejected(address)) => {
                    // Rejected handshakes are not retried automatically;
                    // the peer has to dial us once the config is fixed.
                    warn!(slot = slot_index, %address, "authorization rejected, giving up on peer");
                    return;
                }
                Err(error) => {
                    debug!(slot = slot_index, %error, "peer connect failed, backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                }
            }
        }
    }

    fn peer_target(&self, slot_index: usize) -> Option<(NodeIdentity, u64, SocketAddr)> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get(slot_index)?;
        if slot.server.channel.is_some() {
            return None;
        }
        let address = *slot.server.identity.listen_addresses.first()?;
        Some((slot.server.identity.clone(), slot.generation, address))
    }

    /// Connects and authorizes against one peer (initiator role).
    async fn establish(
        self: &Arc<Self>,
        slot_index: usize,
    ) -> Result<Arc<NetworkChannel>, crate::network::NetworkError> {
        let Some((identity, generation, address)) = self.peer_target(slot_index) else {
            // Already connected (the peer dialed us); wait for a state
            // change before probing again.
            tokio::time::sleep(RECONNECT_BACKOFF_MAX).await;
            return Err(crate::network::NetworkError::Decode(
                "slot already connected".to_string(),
            ));
        };

        let channel = self.client.connect(address).await?;
        channel.attach(ChannelAttachment::Node {
            slot: slot_index,
            generation,
        });
        self.change_slot_state(slot_index, generation, NodeServerState::Connected, None);

        let (cluster_id, local_identity) = {
            let config = self.config.read().unwrap_or_else(|e| e.into_inner());
            (config.cluster_id, config.local_node.clone())
        };
        let request = AuthRequest::NodeToNode {
            cluster_id,
            identity: local_identity,
        };

        let (tx, rx) = oneshot::channel();
        self.pending_auth.insert(channel.id(), tx);
        channel
            .send_sync(Packet::with_id(channels::AUTH, AUTH_PACKET_ID, request.encode()))
            .await?;

        let response = match tokio::time::timeout(AUTH_RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            _ => {
                self.pending_auth.remove(&channel.id());
                channel.close();
                return Err(crate::network::NetworkError::Decode(
                    "authorization response timed out".to_string(),
                ));
            }
        };

        if !response.success {
            channel.close();
            return Err(crate::network::NetworkError::AuthRejected(address));
        }

        channel.mark_authorized();

        if response.initial_sync {
            // The peer considered us disconnected: apply its authoritative
            // snapshot, then acknowledge so it marks us READY.
            if let Some(snapshot) = &response.snapshot {
                match ClusterSyncData::decode(snapshot) {
                    Ok(data) => self.sync.apply_cluster_data(&data),
                    Err(error) => warn!(%error, "malformed cluster snapshot"),
                }
            }
            channel
                .send_sync(Packet::new(channels::SERVICE_SYNC_ACK, Bytes::new()))
                .await?;
        }

        self.change_slot_state(
            slot_index,
            generation,
            NodeServerState::Ready,
            Some(Arc::clone(&channel)),
        );
        if let Some(head) = self.recompute_head() {
            self.announce_head_change(head).await;
        }
        info!(peer = %identity.name, "cluster peer connected");
        Ok(channel)
    }

    fn change_slot_state(
        &self,
        slot_index: usize,
        generation: u64,
        state: NodeServerState,
        channel: Option<Arc<NetworkChannel>>,
    ) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.get_mut(slot_index) else {
            return false;
        };
        if slot.generation != generation {
            return false;
        }
        slot.server.change_state(state);
        if let Some(channel) = channel {
            slot.server.channel = Some(channel);
        }
        true
    }

    /// Close callback target: bounds plus generation check, then the
    /// disconnect transition.
    pub(crate) async fn handle_channel_close(self: &Arc<Self>, slot_index: usize, generation: u64) {
        let closed = {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(slot_index) {
                Some(slot) if slot.generation == generation => {
                    slot.generation += 1;
                    slot.server.channel = None;
                    slot.server.change_state(NodeServerState::Disconnected);
                    Some((
                        slot.server.identity.unique_id,
                        slot.server.name().to_string(),
                    ))
                }
                _ => None,
            }
        };

        let Some((unique_id, name)) = closed else {
            return;
        };

        warn!(peer = %name, "cluster peer disconnected");
        self.events.publish(NodeEvent::NodeDisconnected {
            node_name: name.clone(),
        });
        if let Some(head) = self.recompute_head() {
            self.announce_head_change(head).await;
        }
        if let Some(actions) = self.disconnect_actions.get().and_then(Weak::upgrade) {
            actions.handle_node_disconnect(unique_id, &name).await;
        }
    }

    // ------------------------------------------------------------------
    // Acceptor role
    // ------------------------------------------------------------------

    async fn handle_auth_request(
        self: &Arc<Self>,
        channel: &Arc<NetworkChannel>,
        packet: Packet,
    ) {
        let request = match AuthRequest::decode(&packet.payload) {
            Ok(request) => request,
            Err(error) => {
                warn!(remote = %channel.remote_address(), %error, "malformed auth request");
                self.deny(channel, packet.packet_id).await;
                return;
            }
        };

        match request {
            AuthRequest::NodeToNode {
                cluster_id,
                identity,
            } => {
                self.handle_node_auth(channel, packet.packet_id, cluster_id, identity)
                    .await
            }
            AuthRequest::ServiceToNode {
                connection_key,
                service_id,
            } => {
                let authenticated = match self.service_auth.get().and_then(Weak::upgrade) {
                    Some(authenticator) => {
                        authenticator
                            .authenticate_agent(&connection_key, &service_id, channel)
                            .await
                    }
                    None => false,
                };
                if authenticated {
                    channel.mark_authorized();
                    channel.attach(ChannelAttachment::Service {
                        unique_id: service_id.unique_id,
                    });
                    let _ = channel
                        .send(Packet::with_id(
                            channels::AUTH,
                            packet.packet_id,
                            AuthResponse::accepted().encode(),
                        ))
                        .await;
                    self.events.publish(NodeEvent::ServiceAuthSuccess {
                        service_name: service_id.name(),
                    });
                    info!(service = %service_id.name(), "service agent connected");
                } else {
                    self.deny(channel, packet.packet_id).await;
                }
            }
        }
    }

    async fn handle_node_auth(
        self: &Arc<Self>,
        channel: &Arc<NetworkChannel>,
        packet_id: u64,
        cluster_id: Uuid,
        identity: NodeIdentity,
    ) {
        // Cluster id and source whitelist gate the handshake.
        let permitted = {
            let config = self.config.read().unwrap_or_else(|e| e.into_inner());
            config.cluster_id == cluster_id && config.whitelisted(&channel.remote_address())
        };
        if !permitted {
            warn!(remote = %channel.remote_address(), "node auth rejected");
            self.deny(channel, packet_id).await;
            return;
        }

        let slot_info = {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            slots
                .iter()
                .enumerate()
                .find(|(_, slot)| slot.server.identity.unique_id == identity.unique_id)
                .map(|(index, slot)| (index, slot.generation, slot.server.state))
        };
        let Some((slot_index, generation, state)) = slot_info else {
            // Unknown node id: no roster entry, close the connection.
            warn!(remote = %channel.remote_address(), node = %identity.name, "unknown cluster node");
            self.deny(channel, packet_id).await;
            return;
        };

        channel.mark_authorized();
        channel.attach(ChannelAttachment::Node {
            slot: slot_index,
            generation,
        });

        if state == NodeServerState::Disconnected {
            // Reconnect: push the authoritative snapshot and hold the peer
            // in SYNCING until it acknowledges.
            let data = self.sync.prepare_cluster_data(true);
            let response = AuthResponse::accepted_with_sync(data.encode());
            self.change_slot_state(
                slot_index,
                generation,
                NodeServerState::Syncing,
                Some(Arc::clone(channel)),
            );
            let _ = channel
                .send(Packet::with_id(channels::AUTH, packet_id, response.encode()))
                .await;
            self.events.publish(NodeEvent::NodeReconnect {
                node_name: identity.name.clone(),
            });
            info!(peer = %identity.name, "reconnected peer is syncing");
        } else {
            self.change_slot_state(
                slot_index,
                generation,
                NodeServerState::Ready,
                Some(Arc::clone(channel)),
            );
            let _ = channel
                .send(Packet::with_id(
                    channels::AUTH,
                    packet_id,
                    AuthResponse::accepted().encode(),
                ))
                .await;
            if let Some(head) = self.recompute_head() {
                self.announce_head_change(head).await;
            }
            self.events.publish(NodeEvent::NodeAuthSuccess {
                node_name: identity.name.clone(),
            });
            info!(peer = %identity.name, "cluster peer authorized");
        }
    }

    async fn deny(&self, channel: &Arc<NetworkChannel>, packet_id: u64) {
        // Flush the rejection before closing so the peer sees it.
        let _ = channel
            .send_sync(Packet::with_id(
                channels::AUTH,
                packet_id,
                AuthResponse::denied().encode(),
            ))
            .await;
        channel.close();
    }

    /// Sync-ack from a reconnected peer: it applied the snapshot.
    async fn handle_sync_ack(self: &Arc<Self>, channel: &Arc<NetworkChannel>) {
        let Some(ChannelAttachment::Node { slot, generation }) = channel.attachment() else {
            return;
        };
        if self.change_slot_state(slot, generation, NodeServerState::Ready, None) {
            let name = {
                let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
                slots
                    .get(slot)
                    .map(|s| s.server.name().to_string())
                    .unwrap_or_default()
            };
            if let Some(head) = self.recompute_head() {
                self.announce_head_change(head).await;
            }
            self.events
                .publish(NodeEvent::NodeAuthSuccess { node_name: name.clone() });
            info!(peer = %name, "reconnected peer is ready");
        }
    }
}

fn view_of(server: &NodeServer) -> NodeServerView {
    NodeServerView {
        identity: server.identity.clone(),
        state: server.state,
        head: server.head,
        drain: server.drain,
        last_state_change_ms: server.last_state_change_ms,
        resources: server.resources.clone(),
    }
}

impl ClusterChannelAccess for NodeServerProvider {
    fn ready_peer_channels(&self) -> Vec<(String, Arc<NetworkChannel>)> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .filter(|slot| slot.server.available())
            .filter_map(|slot| {
                slot.server
                    .channel
                    .clone()
                    .map(|channel| (slot.server.name().to_string(), channel))
            })
            .collect()
    }

    fn peer_channel(&self, name: &str) -> Option<Arc<NetworkChannel>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .find(|slot| slot.server.name() == name && slot.server.available())
            .and_then(|slot| slot.server.channel.clone())
    }
}

// ----------------------------------------------------------------------
// Packet listeners
// ----------------------------------------------------------------------

/// Wire channel 0: handshake requests (acceptor role) and answers
/// (initiator role). Answers are told apart by the pending-auth entry the
/// initiator registered for its channel.
pub struct AuthPacketListener {
    provider: Weak<NodeServerProvider>,
}

impl AuthPacketListener {
    pub fn new(provider: &Arc<NodeServerProvider>) -> Self {
        Self {
            provider: Arc::downgrade(provider),
        }
    }
}

#[async_trait]
impl PacketListener for AuthPacketListener {
    async fn handle(&self, channel: &Arc<NetworkChannel>, packet: Packet) {
        let Some(provider) = self.provider.upgrade() else {
            return;
        };

        if let Some((_, waiter)) = provider.pending_auth.remove(&channel.id()) {
            match AuthResponse::decode(&packet.payload) {
                Ok(response) => {
                    let _ = waiter.send(response);
                }
                Err(error) => {
                    warn!(%error, "malformed auth response");
                    channel.close();
                }
            }
            return;
        }

        provider.handle_auth_request(channel, packet).await;
    }
}

/// Wire channel 4: snapshot acknowledgements of reconnected peers.
pub struct SyncAckPacketListener {
    provider: Weak<NodeServerProvider>,
}

impl SyncAckPacketListener {
    pub fn new(provider: &Arc<NodeServerProvider>) -> Self {
        Self {
            provider: Arc::downgrade(provider),
        }
    }
}

#[async_trait]
impl PacketListener for SyncAckPacketListener {
    async fn handle(&self, channel: &Arc<NetworkChannel>, _packet: Packet) {
        if let Some(provider) = self.provider.upgrade() {
            provider.handle_sync_ack(channel).await;
        }
    }
}

/// Routes channel closes carrying a node attachment back to the provider.
pub struct NodeChannelCloseListener {
    provider: Weak<NodeServerProvider>,
    events: Arc<EventBus>,
}

impl NodeChannelCloseListener {
    pub fn new(provider: &Arc<NodeServerProvider>, events: Arc<EventBus>) -> Self {
        Self {
            provider: Arc::downgrade(provider),
            events,
        }
    }
}

#[async_trait]
impl ChannelCloseListener for NodeChannelCloseListener {
    async fn handle_close(&self, channel: &Arc<NetworkChannel>) {
        self.events.publish(NodeEvent::NetworkChannelClose {
            remote: channel.remote_address(),
        });
        if let Some(ChannelAttachment::Node { slot, generation }) = channel.attachment() {
            if let Some(provider) = self.provider.upgrade() {
                provider.handle_channel_close(slot, generation).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::network::PacketListenerRegistry;

    fn identity(name: &str, id_byte: u8) -> NodeIdentity {
        NodeIdentity {
            unique_id: Uuid::from_bytes([
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, id_byte,
            ]),
            name: name.to_string(),
            listen_addresses: vec!["127.0.0.1:1410".parse().unwrap()],
        }
    }

    fn provider_with_peers(local: NodeIdentity, peers: Vec<NodeIdentity>) -> Arc<NodeServerProvider> {
        let mut config = ClusterConfig::fresh("unused");
        config.local_node = local;
        config.remote_nodes = peers;
        let config: SharedConfig = Arc::new(RwLock::new(config));

        let listeners = Arc::new(PacketListenerRegistry::new());
        NodeServerProvider::new(
            config,
            Arc::new(EventBus::new()),
            ChannelMessenger::new("unused"),
            Arc::new(DataSyncRegistry::new()),
            NetworkClient::new(listeners),
        )
    }

    fn mark_ready(provider: &NodeServerProvider, name: &str) {
        let mut slots = provider.slots.write().unwrap();
        let slot = slots
            .iter_mut()
            .find(|slot| slot.server.name() == name)
            .expect("peer exists");
        slot.server.change_state(NodeServerState::Ready);
    }

    #[tokio::test]
    async fn test_head_is_smallest_ready_unique_id() {
        // Local is C; peers A < B < C by unique id.
        let provider = provider_with_peers(
            identity("node-c", 3),
            vec![identity("node-a", 1), identity("node-b", 2)],
        );

        // Nothing ready yet: the local node is head by default.
        assert_eq!(provider.head_name(), "node-c");

        mark_ready(&provider, "node-b");
        provider.recompute_head();
        assert_eq!(provider.head_name(), "node-b");

        mark_ready(&provider, "node-a");
        provider.recompute_head();
        assert_eq!(provider.head_name(), "node-a");
        assert!(!provider.is_head_local());
    }

    #[tokio::test]
    async fn test_head_moves_on_disconnect() {
        let provider = provider_with_peers(
            identity("node-c", 3),
            vec![identity("node-a", 1), identity("node-b", 2)],
        );
        mark_ready(&provider, "node-a");
        mark_ready(&provider, "node-b");
        provider.recompute_head();
        assert_eq!(provider.head_name(), "node-a");

        // A's channel closes: generation 0 slot 0.
        provider.handle_channel_close(0, 0).await;
        assert_eq!(provider.head_name(), "node-b");

        let view = provider.node_server_by_name("node-a").unwrap();
        assert_eq!(view.state, NodeServerState::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_generation_close_is_ignored() {
        let provider = provider_with_peers(identity("node-b", 2), vec![identity("node-a", 1)]);
        mark_ready(&provider, "node-a");
        provider.recompute_head();

        // First close consumes generation 0.
        provider.handle_channel_close(0, 0).await;
        mark_ready(&provider, "node-a");
        provider.recompute_head();

        // A stale callback with the old generation must not disconnect the
        // re-established peer.
        provider.handle_channel_close(0, 0).await;
        assert_eq!(
            provider.node_server_by_name("node-a").unwrap().state,
            NodeServerState::Ready
        );

        // Out-of-bounds slots are ignored as well.
        provider.handle_channel_close(99, 0).await;
    }

    #[tokio::test]
    async fn test_placement_candidates_exclude_drained_and_not_ready() {
        let provider = provider_with_peers(
            identity("node-a", 1),
            vec![identity("node-b", 2), identity("node-c", 3)],
        );
        mark_ready(&provider, "node-b");

        let candidates = provider.placement_candidates();
        let names: Vec<_> = candidates.iter().map(|c| c.node_name.as_str()).collect();
        assert_eq!(names, vec!["node-a", "node-b"]);

        provider.set_local_drain(true);
        let names: Vec<_> = provider
            .placement_candidates()
            .iter()
            .map(|c| c.node_name.to_string())
            .collect();
        assert_eq!(names, vec!["node-b".to_string()]);
    }
}
