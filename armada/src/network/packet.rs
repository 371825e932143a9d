//! Packet model and reserved wire channel ids.

use bytes::Bytes;

/// Reserved wire channel ids. Stable across versions.
pub mod channels {
    /// Authorization handshake frames.
    pub const AUTH: u32 = 0;
    /// Chunked transfer frames.
    pub const CHUNK: u32 = 1;
    /// Channel-message bus frames.
    pub const CHANNEL_MESSAGE: u32 = 2;
    /// Query responses, correlated by packet unique id.
    pub const QUERY_RESPONSE: u32 = 3;
    /// Cluster snapshot acknowledgement after a reconnect sync.
    pub const SERVICE_SYNC_ACK: u32 = 4;
}

/// A single frame on a transport channel.
///
/// On the wire: `[varInt length][varInt channelId][varInt packetUniqueId | 0
/// if none][payload]`.
#[derive(Clone, Debug)]
pub struct Packet {
    pub channel: u32,
    /// Correlation id for query/response pairs; `0` when unused.
    pub packet_id: u64,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(channel: u32, payload: Bytes) -> Self {
        Self {
            channel,
            packet_id: 0,
            payload,
        }
    }

    pub fn with_id(channel: u32, packet_id: u64, payload: Bytes) -> Self {
        Self {
            channel,
            packet_id,
            payload,
        }
    }

    pub fn has_packet_id(&self) -> bool {
        self.packet_id != 0
    }
}
