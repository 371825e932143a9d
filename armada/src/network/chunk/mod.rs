//! Chunked transfer of large payloads.
//!
//! Payloads above the frame budget are split into fixed-size chunks tagged
//! with a session id and a running index. The receiving side stages chunks
//! into a file under the process temp dir and hands the finished file to a
//! per-transfer-channel handler (e.g. template unpack).

mod sender;
mod session;

pub use sender::{ChunkedPacketSender, NetworkChannelsPacketSplitter, PacketSplitter};
pub use session::{ChunkSessionHandler, ChunkSessionInfo, ChunkedSessionRegistry};

use super::error::NetworkError;
use super::packet::{channels, Packet};
use super::wire;
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Default chunk payload size: the frame budget of the transport.
pub const DEFAULT_CHUNK_SIZE: usize = 50 * 1024 * 1024;

/// One fragment of a chunked transfer, carried on wire channel 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkPacket {
    pub session_id: Uuid,
    /// Names the transfer kind; selects the receiving session handler.
    pub transfer_channel: String,
    pub index: u64,
    pub is_last: bool,
    pub payload: Bytes,
}

impl ChunkPacket {
    pub fn into_packet(self) -> Packet {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 64);
        wire::put_uuid(&mut buf, &self.session_id);
        wire::put_string(&mut buf, &self.transfer_channel);
        wire::put_var_u64(&mut buf, self.index);
        wire::put_bool(&mut buf, self.is_last);
        buf.put_slice(&self.payload);
        Packet::new(channels::CHUNK, buf.freeze())
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, NetworkError> {
        let mut buf = packet.payload.clone();
        let session_id = wire::get_uuid(&mut buf)?;
        let transfer_channel = wire::get_string(&mut buf)?;
        let index = wire::get_var_u64(&mut buf)?;
        let is_last = wire::get_bool(&mut buf)?;
        Ok(Self {
            session_id,
            transfer_channel,
            index,
            is_last,
            payload: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_packet_roundtrip() {
        let chunk = ChunkPacket {
            session_id: Uuid::new_v4(),
            transfer_channel: "template_transfer".to_string(),
            index: 7,
            is_last: true,
            payload: Bytes::from_static(b"tail bytes"),
        };

        let decoded = ChunkPacket::from_packet(&chunk.clone().into_packet()).unwrap();
        assert_eq!(decoded, chunk);
    }
}
