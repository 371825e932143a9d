//! The channel-message bus.
//!
//! Serializes [`ChannelMessage`]s onto wire channel 2 and routes them by
//! target: to READY cluster peers, to local service agent channels and to
//! local subscribers. Queries correlate replies through wire channel 3
//! using the message's query id.

use super::message::{ChannelMessage, ChannelMessageSender, ChannelMessageTarget};
use crate::network::{channels, NetworkChannel, Packet, PacketListener};
use crate::network::{wire, NetworkError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default window a query waits for replies.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(20);

/// View of the cluster roster the bus routes node targets through.
pub trait ClusterChannelAccess: Send + Sync {
    /// `(node name, channel)` of every READY peer.
    fn ready_peer_channels(&self) -> Vec<(String, Arc<NetworkChannel>)>;

    /// Channel of one READY peer by node name.
    fn peer_channel(&self, name: &str) -> Option<Arc<NetworkChannel>>;
}

/// View of known services the bus routes service targets through.
pub trait ServiceChannelAccess: Send + Sync {
    /// Agent channels of all local, connected services.
    fn local_agent_channels(&self) -> Vec<(String, Arc<NetworkChannel>)>;

    /// Agent channel of one local service by display name.
    fn local_agent_channel(&self, name: &str) -> Option<Arc<NetworkChannel>>;

    /// Owning node name of a known (not necessarily local) service.
    fn owner_node_of(&self, service_name: &str) -> Option<String>;

    /// Display names of known services matching a task/group/environment
    /// target. Expansion happens at send time.
    fn expand_target(&self, target: &ChannelMessageTarget) -> Vec<String>;
}

/// Delivery context of an inbound message.
pub struct InboundContext {
    /// Channel the message arrived on; `None` for locally originated
    /// messages.
    pub origin: Option<Arc<NetworkChannel>>,
}

/// Handles messages delivered to local subscribers.
///
/// A returned buffer is only honored as a reply when the inbound message
/// carries a query id.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ChannelMessage, context: &InboundContext) -> Option<Bytes>;
}

struct Subscription {
    channel: String,
    message: Option<String>,
    handler: Arc<dyn MessageHandler>,
}

/// Result of a query send.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub replies: Vec<ChannelMessage>,
    /// True when the window elapsed before every addressed peer replied.
    pub timed_out: bool,
}

/// Where an inbound message came from, deciding re-forward rules: messages
/// received from another node are only expanded locally, never forwarded to
/// further nodes.
#[derive(Clone)]
enum Origin {
    Local,
    RemoteNode(Arc<NetworkChannel>),
    ServiceAgent(Arc<NetworkChannel>),
}

impl Origin {
    fn may_forward_to_nodes(&self) -> bool {
        !matches!(self, Origin::RemoteNode(_))
    }

    fn reply_channel(&self) -> Option<&Arc<NetworkChannel>> {
        match self {
            Origin::Local => None,
            Origin::RemoteNode(channel) | Origin::ServiceAgent(channel) => Some(channel),
        }
    }
}

#[derive(Default)]
struct RouteSummary {
    /// Channels the message was forwarded to.
    remote_forwards: usize,
    /// Replies produced by local subscribers, in registration order.
    local_replies: Vec<ChannelMessage>,
}

/// The bus instance of one node.
pub struct ChannelMessenger {
    local_node: String,
    subscriptions: RwLock<Vec<Subscription>>,
    queries: DashMap<Uuid, mpsc::UnboundedSender<ChannelMessage>>,
    cluster: OnceLock<Weak<dyn ClusterChannelAccess>>,
    services: OnceLock<Weak<dyn ServiceChannelAccess>>,
}

impl ChannelMessenger {
    pub fn new(local_node: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            local_node: local_node.into(),
            subscriptions: RwLock::new(Vec::new()),
            queries: DashMap::new(),
            cluster: OnceLock::new(),
            services: OnceLock::new(),
        })
    }

    /// Late-binds the roster and service lookups; called once during node
    /// wiring, after the collaborating subsystems exist.
    pub fn attach(
        &self,
        cluster: Weak<dyn ClusterChannelAccess>,
        services: Weak<dyn ServiceChannelAccess>,
    ) {
        let _ = self.cluster.set(cluster);
        let _ = self.services.set(services);
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Registers a subscriber on a `(channel, message?)` pair. Handlers on
    /// the same pair run in registration order.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        message: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        subscriptions.push(Subscription {
            channel: channel.into(),
            message: message.map(str::to_string),
            handler,
        });
    }

    fn cluster(&self) -> Option<Arc<dyn ClusterChannelAccess>> {
        self.cluster.get().and_then(Weak::upgrade)
    }

    fn services(&self) -> Option<Arc<dyn ServiceChannelAccess>> {
        self.services.get().and_then(Weak::upgrade)
    }

    fn fill_sender(&self, message: &mut ChannelMessage) {
        if message.sender.name().is_empty() {
            message.sender = ChannelMessageSender::Node(self.local_node.clone());
        }
    }

    /// Fire-and-forget send. Undeliverable targets are dropped
    /// (at-most-once, no retries).
    pub async fn send(&self, mut message: ChannelMessage) {
        self.fill_sender(&mut message);
        self.route(&message, Origin::Local).await;
    }

    /// Sends a query and gathers replies until every addressed remote
    /// channel answered or the window elapsed.
    pub async fn send_query(&self, message: ChannelMessage, timeout: Duration) -> QueryResult {
        self.query_inner(message, timeout, usize::MAX).await
    }

    /// Sends a query and resolves with the first reply, if any arrives
    /// within the window.
    pub async fn send_single_query(
        &self,
        message: ChannelMessage,
        timeout: Duration,
    ) -> Option<ChannelMessage> {
        let result = self.query_inner(message, timeout, 1).await;
        result.replies.into_iter().next()
    }

    async fn query_inner(
        &self,
        mut message: ChannelMessage,
        timeout: Duration,
        max_replies: usize,
    ) -> QueryResult {
        self.fill_sender(&mut message);
        if message.query_id.is_none() {
            message.query_id = Some(Uuid::new_v4());
        }
        let query_id = message.query_id.expect("query id set above");

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.queries.insert(query_id, tx);
        // Dropping the guard removes the correlation entry, also on
        // cancellation of the surrounding future.
        let _guard = QueryGuard {
            queries: &self.queries,
            query_id,
        };

        let summary = self.route(&message, Origin::Local).await;
        let mut result = QueryResult {
            replies: summary.local_replies,
            timed_out: false,
        };

        let expected_remote = summary.remote_forwards;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut remote_replies = 0usize;
        while remote_replies < expected_remote && result.replies.len() < max_replies {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) => {
                    remote_replies += 1;
                    result.replies.push(reply);
                }
                Ok(None) => break,
                Err(_) => {
                    result.timed_out = true;
                    break;
                }
            }
        }
        result.replies.truncate(max_replies.min(result.replies.len()));
        result
    }

    /// Sends a message directly over one channel, bypassing target
    /// routing. Used for per-channel streams like screen forwarding.
    pub async fn send_via_channel(
        &self,
        channel: &Arc<NetworkChannel>,
        mut message: ChannelMessage,
    ) {
        self.fill_sender(&mut message);
        let packet = Packet::new(channels::CHANNEL_MESSAGE, encode_frame(&message));
        if let Err(error) = channel.send(packet).await {
            debug!(remote = %channel.remote_address(), %error, "direct message dropped");
        }
    }

    /// Entry point for replies arriving on wire channel 3.
    fn accept_reply(&self, reply: ChannelMessage) {
        let Some(query_id) = reply.query_id else {
            return;
        };
        match self.queries.get(&query_id) {
            Some(entry) => {
                let _ = entry.value().send(reply);
            }
            None => trace!(%query_id, "reply for unknown or cancelled query"),
        }
    }

    /// Entry point for messages arriving over the network.
    async fn handle_incoming(
        self: &Arc<Self>,
        message: ChannelMessage,
        expect_response: bool,
        channel: &Arc<NetworkChannel>,
    ) {
        let origin = match channel.attachment() {
            Some(crate::network::ChannelAttachment::Service { .. }) => {
                Origin::ServiceAgent(Arc::clone(channel))
            }
            _ => Origin::RemoteNode(Arc::clone(channel)),
        };

        let summary = self.route(&message, origin.clone()).await;

        if expect_response && message.query_id.is_some() {
            if let Some(reply_channel) = origin.reply_channel() {
                for reply in summary.local_replies {
                    let packet = Packet::new(channels::QUERY_RESPONSE, reply.encode());
                    if let Err(error) = reply_channel.send(packet).await {
                        debug!(%error, "failed to send query reply");
                    }
                }
            }
        }
    }

    async fn route(&self, message: &ChannelMessage, origin: Origin) -> RouteSummary {
        let mut summary = RouteSummary::default();
        let services = self.services();
        let cluster = self.cluster();

        // Expand task/group/environment targets to concrete service names
        // at send time.
        let mut node_targets: Vec<String> = Vec::new();
        let mut service_targets: Vec<String> = Vec::new();
        let mut to_all_nodes = false;
        let mut to_all_services = false;
        let mut to_local_subscribers = false;

        for target in &message.targets {
            match target {
                ChannelMessageTarget::All => {
                    to_all_nodes = true;
                    to_all_services = true;
                    to_local_subscribers = true;
                }
                ChannelMessageTarget::AllNodes => {
                    to_all_nodes = true;
                    to_local_subscribers = true;
                }
                ChannelMessageTarget::AllServices => to_all_services = true,
                ChannelMessageTarget::Node(name) => {
                    if *name == self.local_node {
                        to_local_subscribers = true;
                    } else {
                        node_targets.push(name.clone());
                    }
                }
                ChannelMessageTarget::Service(name) => service_targets.push(name.clone()),
                expandable => {
                    if let Some(services) = &services {
                        service_targets.extend(services.expand_target(expandable));
                    }
                }
            }
        }

        if to_local_subscribers {
            let context = InboundContext {
                origin: origin.reply_channel().cloned(),
            };
            summary.local_replies = self.dispatch_to_subscribers(message, &context).await;
        }

        let frame = encode_frame(message);

        // Service delivery: local agents directly, foreign services through
        // their owning node (unless the message already came from a node).
        if let Some(services) = &services {
            if to_all_services {
                for (name, channel) in services.local_agent_channels() {
                    trace!(service = %name, "forwarding message to local agent");
                    self.forward(message, &frame, &channel, &mut summary).await;
                }
            }
            for name in &service_targets {
                if let Some(channel) = services.local_agent_channel(name) {
                    self.forward(message, &frame, &channel, &mut summary).await;
                } else if origin.may_forward_to_nodes() {
                    let owner = services.owner_node_of(name);
                    match owner.and_then(|owner| cluster.as_ref()?.peer_channel(&owner)) {
                        Some(channel) => {
                            self.forward(message, &frame, &channel, &mut summary).await
                        }
                        None => {
                            trace!(service = %name, "no route to service, dropping");
                        }
                    }
                }
            }
        }

        // Node delivery.
        if origin.may_forward_to_nodes() {
            if let Some(cluster) = &cluster {
                if to_all_nodes || to_all_services {
                    for (name, channel) in cluster.ready_peer_channels() {
                        trace!(node = %name, "forwarding message to peer");
                        self.forward(message, &frame, &channel, &mut summary).await;
                    }
                } else {
                    for name in &node_targets {
                        match cluster.peer_channel(name) {
                            Some(channel) => {
                                self.forward(message, &frame, &channel, &mut summary).await
                            }
                            None => trace!(node = %name, "target node not ready, dropping"),
                        }
                    }
                }
            }
        }

        summary
    }

    async fn forward(
        &self,
        message: &ChannelMessage,
        frame: &Bytes,
        channel: &Arc<NetworkChannel>,
        summary: &mut RouteSummary,
    ) {
        let packet = Packet::new(channels::CHANNEL_MESSAGE, frame.clone());
        let sent = if message.send_sync {
            channel.send_sync(packet).await
        } else {
            channel.send(packet).await
        };
        match sent {
            Ok(()) => summary.remote_forwards += 1,
            Err(error) => debug!(remote = %channel.remote_address(), %error, "message dropped"),
        }
    }

    async fn dispatch_to_subscribers(
        &self,
        message: &ChannelMessage,
        context: &InboundContext,
    ) -> Vec<ChannelMessage> {
        let handlers: Vec<Arc<dyn MessageHandler>> = {
            let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
            subscriptions
                .iter()
                .filter(|s| {
                    s.channel == message.channel
                        && s.message
                            .as_ref()
                            .is_none_or(|m| *m == message.message)
                })
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        let mut replies = Vec::new();
        for handler in handlers {
            if let Some(content) = handler.handle(message, context).await {
                // A reply buffer is only honored for queries.
                if message.query_id.is_some() {
                    replies.push(message.reply_to(
                        ChannelMessageSender::Node(self.local_node.clone()),
                        content,
                    ));
                }
            }
        }

        replies
    }
}

struct QueryGuard<'a> {
    queries: &'a DashMap<Uuid, mpsc::UnboundedSender<ChannelMessage>>,
    query_id: Uuid,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        self.queries.remove(&self.query_id);
    }
}

fn encode_frame(message: &ChannelMessage) -> Bytes {
    let encoded = message.encode();
    let mut buf = BytesMut::with_capacity(encoded.len() + 1);
    buf.extend_from_slice(&encoded);
    wire::put_bool(&mut buf, message.query_id.is_some());
    buf.freeze()
}

fn decode_frame(payload: &Bytes) -> Result<(ChannelMessage, bool), NetworkError> {
    // The expect-response flag is the trailing byte after the message body.
    if payload.is_empty() {
        return Err(NetworkError::Decode("empty channel message frame".to_string()));
    }
    let body = payload.slice(..payload.len() - 1);
    let message = ChannelMessage::decode(&body)?;
    let expect_response = payload[payload.len() - 1] != 0;
    Ok((message, expect_response))
}

/// Listener on wire channel 2: inbound channel messages.
pub struct ChannelMessageListener {
    messenger: Weak<ChannelMessenger>,
}

impl ChannelMessageListener {
    pub fn new(messenger: &Arc<ChannelMessenger>) -> Self {
        Self {
            messenger: Arc::downgrade(messenger),
        }
    }
}

#[async_trait]
impl PacketListener for ChannelMessageListener {
    async fn handle(&self, channel: &Arc<NetworkChannel>, packet: Packet) {
        let Some(messenger) = self.messenger.upgrade() else {
            return;
        };
        match decode_frame(&packet.payload) {
            Ok((message, expect_response)) => {
                messenger
                    .handle_incoming(message, expect_response, channel)
                    .await;
            }
            Err(error) => warn!(%error, "malformed channel message"),
        }
    }
}

/// Listener on wire channel 3: query replies.
pub struct QueryResponseListener {
    messenger: Weak<ChannelMessenger>,
}

impl QueryResponseListener {
    pub fn new(messenger: &Arc<ChannelMessenger>) -> Self {
        Self {
            messenger: Arc::downgrade(messenger),
        }
    }
}

#[async_trait]
impl PacketListener for QueryResponseListener {
    async fn handle(&self, _channel: &Arc<NetworkChannel>, packet: Packet) {
        let Some(messenger) = self.messenger.upgrade() else {
            return;
        };
        match ChannelMessage::decode(&packet.payload) {
            Ok(reply) => messenger.accept_reply(reply),
            Err(error) => warn!(%error, "malformed query response"),
        }
    }
}
