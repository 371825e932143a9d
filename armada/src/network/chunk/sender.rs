//! Chunked transfer sender side.

use super::{ChunkPacket, DEFAULT_CHUNK_SIZE};
use crate::network::channel::NetworkChannel;
use crate::network::error::NetworkError;
use crate::network::packet::Packet;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;
use uuid::Uuid;

/// Routes the frames of one transfer onto transport channels.
#[async_trait]
pub trait PacketSplitter: Send + Sync {
    async fn transmit(&self, packet: Packet) -> Result<(), NetworkError>;
}

/// Splitter that broadcasts every chunk to a fixed set of channels.
pub struct NetworkChannelsPacketSplitter {
    channels: Vec<Arc<NetworkChannel>>,
}

impl NetworkChannelsPacketSplitter {
    pub fn new(channels: Vec<Arc<NetworkChannel>>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl PacketSplitter for NetworkChannelsPacketSplitter {
    async fn transmit(&self, packet: Packet) -> Result<(), NetworkError> {
        for channel in &self.channels {
            // Waits when a receiver is slow; that backpressure is the point.
            channel.send(packet.clone()).await?;
        }
        Ok(())
    }
}

/// Builder-style sender fragmenting a stream into [`ChunkPacket`]s.
///
/// ```ignore
/// ChunkedPacketSender::for_stream(file)
///     .transfer_channel("template_transfer")
///     .to_channels(vec![peer_channel])
///     .transfer()
///     .await?;
/// ```
pub struct ChunkedPacketSender<R> {
    source: R,
    session_id: Uuid,
    transfer_channel: String,
    chunk_size: usize,
    splitter: Option<Arc<dyn PacketSplitter>>,
}

impl<R: AsyncRead + Send + Unpin> ChunkedPacketSender<R> {
    pub fn for_stream(source: R) -> Self {
        Self {
            source,
            session_id: Uuid::new_v4(),
            transfer_channel: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            splitter: None,
        }
    }

    pub fn transfer_channel(mut self, name: impl Into<String>) -> Self {
        self.transfer_channel = name.into();
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn splitter(mut self, splitter: Arc<dyn PacketSplitter>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn to_channels(self, channels: Vec<Arc<NetworkChannel>>) -> Self {
        self.splitter(Arc::new(NetworkChannelsPacketSplitter::new(channels)))
    }

    /// Streams the source through the splitter as an ordered chunk
    /// sequence, the final chunk flagged. Returns the number of chunks
    /// sent. An empty source still produces one (empty, last) chunk so the
    /// receiving session completes.
    pub async fn transfer(mut self) -> Result<u64, NetworkError> {
        let splitter = self
            .splitter
            .take()
            .ok_or_else(|| NetworkError::Decode("chunked sender without splitter".to_string()))?;

        let mut index = 0u64;
        let mut current = self.read_chunk().await?;
        loop {
            // Read ahead so the last chunk can be flagged while sending.
            let next = self.read_chunk().await?;
            let is_last = next.is_empty();
            let packet = ChunkPacket {
                session_id: self.session_id,
                transfer_channel: self.transfer_channel.clone(),
                index,
                is_last,
                payload: current,
            }
            .into_packet();
            splitter.transmit(packet).await?;
            index += 1;

            if is_last {
                break;
            }
            current = next;
        }

        debug!(
            session_id = %self.session_id,
            chunks = index,
            "chunked transfer complete"
        );
        Ok(index)
    }

    async fn read_chunk(&mut self) -> Result<Bytes, NetworkError> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let read = self.source.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSplitter {
        sent: Mutex<Vec<ChunkPacket>>,
    }

    #[async_trait]
    impl PacketSplitter for CollectingSplitter {
        async fn transmit(&self, packet: Packet) -> Result<(), NetworkError> {
            let chunk = ChunkPacket::from_packet(&packet)?;
            self.sent.lock().unwrap().push(chunk);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exact_multiple_produces_last_flag_on_final_chunk() {
        let splitter = Arc::new(CollectingSplitter {
            sent: Mutex::new(Vec::new()),
        });
        let data = vec![7u8; 120];

        let sent = ChunkedPacketSender::for_stream(&data[..])
            .transfer_channel("test")
            .chunk_size(50)
            .splitter(Arc::clone(&splitter) as Arc<dyn PacketSplitter>)
            .transfer()
            .await
            .unwrap();

        // 120 bytes at 50 per chunk: 50 + 50 + 20.
        assert_eq!(sent, 3);
        let chunks = splitter.sent.lock().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].payload.len(), 50);
        assert_eq!(chunks[1].payload.len(), 50);
        assert_eq!(chunks[2].payload.len(), 20);
        assert!(!chunks[0].is_last);
        assert!(!chunks[1].is_last);
        assert!(chunks[2].is_last);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), [0, 1, 2]);
    }

    #[tokio::test]
    async fn test_empty_source_sends_single_last_chunk() {
        let splitter = Arc::new(CollectingSplitter {
            sent: Mutex::new(Vec::new()),
        });

        let sent = ChunkedPacketSender::for_stream(&[][..])
            .transfer_channel("test")
            .chunk_size(16)
            .splitter(Arc::clone(&splitter) as Arc<dyn PacketSplitter>)
            .transfer()
            .await
            .unwrap();

        assert_eq!(sent, 1);
        let chunks = splitter.sent.lock().unwrap();
        assert!(chunks[0].is_last);
        assert!(chunks[0].payload.is_empty());
    }
}
