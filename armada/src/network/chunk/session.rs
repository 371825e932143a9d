//! Chunked transfer receiver side.

use super::ChunkPacket;
use crate::event::{EventBus, NodeEvent};
use crate::network::channel::NetworkChannel;
use crate::network::listener::PacketListener;
use crate::network::packet::Packet;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Metadata of a completed (or failed) chunk session.
#[derive(Clone, Debug)]
pub struct ChunkSessionInfo {
    pub session_id: Uuid,
    pub transfer_channel: String,
    pub chunk_count: u64,
}

/// Consumes the staged file of a finished transfer session.
///
/// Registered per transfer channel name; e.g. the template storage
/// registers a handler on `template_transfer` that unpacks the file.
#[async_trait]
pub trait ChunkSessionHandler: Send + Sync {
    async fn session_complete(&self, info: ChunkSessionInfo, staged_file: &Path);
}

struct SessionState {
    transfer_channel: String,
    file: tokio::fs::File,
    path: PathBuf,
    next_index: u64,
}

/// Receives [`ChunkPacket`]s on wire channel 1 and stages them to disk.
///
/// Chunks must arrive in index order; an out-of-order index fails the whole
/// session and removes its staging file. On the final chunk the file is
/// flushed and handed to the transfer channel's handler.
pub struct ChunkedSessionRegistry {
    temp_dir: PathBuf,
    events: Arc<EventBus>,
    handlers: DashMap<String, Arc<dyn ChunkSessionHandler>>,
    sessions: DashMap<Uuid, Arc<tokio::sync::Mutex<SessionState>>>,
}

impl ChunkedSessionRegistry {
    pub fn new(temp_dir: PathBuf, events: Arc<EventBus>) -> Self {
        Self {
            temp_dir,
            events,
            handlers: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Registers the handler consuming finished sessions of a transfer
    /// channel. Replaces any previous handler of the same name.
    pub fn register_handler(&self, transfer_channel: &str, handler: Arc<dyn ChunkSessionHandler>) {
        self.handlers.insert(transfer_channel.to_string(), handler);
    }

    async fn open_session(&self, chunk: &ChunkPacket) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let path = self.temp_dir.join(format!("{}.part", chunk.session_id));
        let file = tokio::fs::File::create(&path).await?;
        self.sessions.insert(
            chunk.session_id,
            Arc::new(tokio::sync::Mutex::new(SessionState {
                transfer_channel: chunk.transfer_channel.clone(),
                file,
                path,
                next_index: 0,
            })),
        );

        self.events.publish(NodeEvent::ChunkedSessionOpen {
            session_id: chunk.session_id,
            transfer_channel: chunk.transfer_channel.clone(),
        });
        debug!(session_id = %chunk.session_id, channel = %chunk.transfer_channel, "chunk session opened");
        Ok(())
    }

    async fn fail_session(&self, session_id: Uuid, reason: &str) {
        if let Some((_, state)) = self.sessions.remove(&session_id) {
            let state = state.lock().await;
            let _ = tokio::fs::remove_file(&state.path).await;
            warn!(session_id = %session_id, reason, "chunk session failed");
        }
    }

    async fn handle_chunk(&self, chunk: ChunkPacket) {
        if !self.sessions.contains_key(&chunk.session_id) {
            if chunk.index != 0 {
                warn!(session_id = %chunk.session_id, index = chunk.index, "chunk for unknown session");
                return;
            }
            if let Err(error) = self.open_session(&chunk).await {
                warn!(session_id = %chunk.session_id, %error, "unable to open chunk session");
                return;
            }
        }

        let Some(state) = self.sessions.get(&chunk.session_id).map(|s| s.value().clone()) else {
            return;
        };
        let mut state = state.lock().await;

        if chunk.index != state.next_index {
            let expected = state.next_index;
            drop(state);
            self.fail_session(
                chunk.session_id,
                &format!("out-of-order chunk {} (expected {expected})", chunk.index),
            )
            .await;
            return;
        }

        if let Err(error) = state.file.write_all(&chunk.payload).await {
            drop(state);
            self.fail_session(chunk.session_id, &error.to_string()).await;
            return;
        }
        state.next_index += 1;

        if chunk.is_last {
            if let Err(error) = state.file.flush().await {
                drop(state);
                self.fail_session(chunk.session_id, &error.to_string()).await;
                return;
            }

            let info = ChunkSessionInfo {
                session_id: chunk.session_id,
                transfer_channel: state.transfer_channel.clone(),
                chunk_count: state.next_index,
            };
            let path = state.path.clone();
            drop(state);
            self.sessions.remove(&chunk.session_id);

            let handler = self.handlers.get(&info.transfer_channel).map(|h| h.value().clone());
            match handler {
                Some(handler) => {
                    handler.session_complete(info, &path).await;
                }
                None => {
                    warn!(
                        channel = %info.transfer_channel,
                        "no session handler registered, discarding transfer"
                    );
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }
}

#[async_trait]
impl PacketListener for ChunkedSessionRegistry {
    async fn handle(&self, _channel: &Arc<NetworkChannel>, packet: Packet) {
        match ChunkPacket::from_packet(&packet) {
            Ok(chunk) => self.handle_chunk(chunk).await,
            Err(error) => warn!(%error, "malformed chunk packet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex;

    struct Completion {
        result: Arc<Mutex<Option<(ChunkSessionInfo, Vec<u8>)>>>,
    }

    #[async_trait]
    impl ChunkSessionHandler for Completion {
        async fn session_complete(&self, info: ChunkSessionInfo, staged_file: &Path) {
            let data = std::fs::read(staged_file).unwrap();
            *self.result.lock().unwrap() = Some((info, data));
        }
    }

    fn registry(dir: &Path) -> (ChunkedSessionRegistry, Arc<Mutex<Option<(ChunkSessionInfo, Vec<u8>)>>>) {
        let registry = ChunkedSessionRegistry::new(dir.to_path_buf(), Arc::new(EventBus::new()));
        let result = Arc::new(Mutex::new(None));
        registry.register_handler(
            "test_transfer",
            Arc::new(Completion {
                result: Arc::clone(&result),
            }),
        );
        (registry, result)
    }

    fn chunk(session: Uuid, index: u64, is_last: bool, payload: &[u8]) -> ChunkPacket {
        ChunkPacket {
            session_id: session,
            transfer_channel: "test_transfer".to_string(),
            index,
            is_last,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[tokio::test]
    async fn test_ordered_chunks_reassemble_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let (registry, result) = registry(dir.path());
        let session = Uuid::new_v4();

        registry.handle_chunk(chunk(session, 0, false, b"hello ")).await;
        registry.handle_chunk(chunk(session, 1, false, b"chunked ")).await;
        registry.handle_chunk(chunk(session, 2, true, b"world")).await;

        let (info, data) = result.lock().unwrap().clone().expect("session completed");
        assert_eq!(info.chunk_count, 3);
        assert_eq!(data, b"hello chunked world");
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_fails_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let (registry, result) = registry(dir.path());
        let session = Uuid::new_v4();

        registry.handle_chunk(chunk(session, 0, false, b"first")).await;
        registry.handle_chunk(chunk(session, 2, true, b"skipped")).await;

        assert!(result.lock().unwrap().is_none());
        assert!(registry.sessions.is_empty());
        // Staging file removed with the failed session.
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_unregistered_transfer_channel_discards() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = ChunkedSessionRegistry::new(dir.path().to_path_buf(), Arc::new(EventBus::new()));
        let session = Uuid::new_v4();

        let mut packet = chunk(session, 0, true, b"data");
        packet.transfer_channel = "nobody_home".to_string();
        registry.handle_chunk(packet).await;

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none());
    }
}
