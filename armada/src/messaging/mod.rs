//! Targeted, multicast and query messaging across the cluster.
//!
//! Channel messages ride on wire channel 2; query replies on wire channel
//! 3. Delivery is at-most-once per peer hop, with per-channel ordering and
//! no retries: undeliverable messages are dropped.

mod bus;
mod message;

pub use bus::{
    ChannelMessageListener, ChannelMessenger, ClusterChannelAccess, InboundContext, MessageHandler,
    QueryResult, QueryResponseListener, ServiceChannelAccess, DEFAULT_QUERY_TIMEOUT,
};
pub use message::{
    ChannelMessage, ChannelMessageBuilder, ChannelMessageSender, ChannelMessageTarget,
};

/// Channel name used by node-internal control messages.
pub const INTERNAL_CHANNEL: &str = "armada:internal";
