//! Transport channel handle and per-connection I/O tasks.

use super::codec::PacketCodec;
use super::error::NetworkError;
use super::listener::PacketListenerRegistry;
use super::packet::{channels, Packet};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Outbound queue depth per channel. A full queue makes senders wait,
/// which is the backpressure contract slow receivers rely on.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct Outbound {
    packet: Packet,
    flushed: Option<oneshot::Sender<()>>,
}

/// What the channel is bound to after authorization, used by close
/// handling to find the owning record without holding a direct reference
/// back into the owner (arena-and-index: slot plus generation).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelAttachment {
    /// A cluster peer occupying the given roster slot.
    Node { slot: usize, generation: u64 },
    /// A service agent identified by its service unique id.
    Service { unique_id: Uuid },
}

/// Handle to one bi-directional transport connection.
///
/// Frames queued with [`Self::send`] are written in order by a dedicated
/// writer task; inbound frames are dispatched to the listener table in
/// arrival order, so per-channel ordering is preserved in both directions.
pub struct NetworkChannel {
    id: u64,
    remote: SocketAddr,
    local: SocketAddr,
    out_tx: mpsc::Sender<Outbound>,
    authorized: AtomicBool,
    closed: CancellationToken,
    attachment: Mutex<Option<ChannelAttachment>>,
}

impl NetworkChannel {
    /// Process-unique id of this channel.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    /// True once the authorization handshake succeeded on this channel.
    pub fn authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    /// Marks the single authorization outcome of this channel.
    pub fn mark_authorized(&self) {
        self.authorized.store(true, Ordering::SeqCst);
    }

    pub fn attachment(&self) -> Option<ChannelAttachment> {
        *self.attachment.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attach(&self, attachment: ChannelAttachment) {
        *self.attachment.lock().unwrap_or_else(|e| e.into_inner()) = Some(attachment);
    }

    /// Queues a packet for transmission. Waits when the outbound queue is
    /// full; fails once the channel is closed.
    pub async fn send(&self, packet: Packet) -> Result<(), NetworkError> {
        self.out_tx
            .send(Outbound {
                packet,
                flushed: None,
            })
            .await
            .map_err(|_| NetworkError::ChannelClosed(self.remote))
    }

    /// Sends a packet and waits until it has been flushed to the wire.
    pub async fn send_sync(&self, packet: Packet) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.out_tx
            .send(Outbound {
                packet,
                flushed: Some(tx),
            })
            .await
            .map_err(|_| NetworkError::ChannelClosed(self.remote))?;
        rx.await.map_err(|_| NetworkError::ChannelClosed(self.remote))
    }

    /// Requests the channel to close. Idempotent; the close listeners fire
    /// once the reader task winds down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the channel has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("authorized", &self.authorized())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Wraps an established TCP stream into a [`NetworkChannel`] and spawns its
/// reader and writer tasks.
pub(crate) fn spawn_channel_io(
    stream: TcpStream,
    listeners: Arc<PacketListenerRegistry>,
) -> Result<Arc<NetworkChannel>, NetworkError> {
    let remote = stream.peer_addr()?;
    let local = stream.local_addr()?;
    let _ = stream.set_nodelay(true);

    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let channel = Arc::new(NetworkChannel {
        id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
        remote,
        local,
        out_tx,
        authorized: AtomicBool::new(false),
        closed: CancellationToken::new(),
        attachment: Mutex::new(None),
    });

    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, PacketCodec::new());
    let writer = FramedWrite::new(write_half, PacketCodec::new());

    tokio::spawn(write_loop(Arc::clone(&channel), writer, out_rx));
    tokio::spawn(read_loop(Arc::clone(&channel), reader, listeners));

    Ok(channel)
}

async fn write_loop(
    channel: Arc<NetworkChannel>,
    mut writer: FramedWrite<tokio::net::tcp::OwnedWriteHalf, PacketCodec>,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = channel.closed.cancelled() => break,
            outbound = out_rx.recv() => match outbound {
                Some(outbound) => outbound,
                None => break,
            },
        };

        if let Err(error) = writer.send(outbound.packet).await {
            debug!(remote = %channel.remote, %error, "write failed, closing channel");
            channel.closed.cancel();
            break;
        }
        if let Some(flushed) = outbound.flushed {
            let _ = flushed.send(());
        }
    }

    let _ = writer.close().await;
}

async fn read_loop(
    channel: Arc<NetworkChannel>,
    mut reader: FramedRead<tokio::net::tcp::OwnedReadHalf, PacketCodec>,
    listeners: Arc<PacketListenerRegistry>,
) {
    // One ordered dispatch lane per wire channel id. Frames of the same
    // wire channel are handled sequentially in arrival order, while a slow
    // handler on one wire channel (say, a service RPC) cannot stall the
    // others (say, the query responses that RPC is waiting for).
    let mut lanes: std::collections::HashMap<u32, mpsc::UnboundedSender<Packet>> =
        std::collections::HashMap::new();

    loop {
        let frame = tokio::select! {
            biased;
            _ = channel.closed.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(packet)) => {
                // Every channel has exactly one authorization outcome;
                // anything but auth frames is dropped until it happened.
                if !channel.authorized() && packet.channel != channels::AUTH {
                    trace!(
                        remote = %channel.remote,
                        wire_channel = packet.channel,
                        "dropping packet on unauthorized channel"
                    );
                    continue;
                }

                // Auth frames dispatch inline: the authorization outcome
                // must be settled before the next frame is read.
                if packet.channel == channels::AUTH {
                    listeners.dispatch(&channel, packet).await;
                    continue;
                }

                let lane = lanes.entry(packet.channel).or_insert_with(|| {
                    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
                    let listeners = Arc::clone(&listeners);
                    let channel = Arc::clone(&channel);
                    tokio::spawn(async move {
                        while let Some(packet) = rx.recv().await {
                            listeners.dispatch(&channel, packet).await;
                        }
                    });
                    tx
                });
                let _ = lane.send(packet);
            }
            Some(Err(error)) => {
                warn!(remote = %channel.remote, %error, "read failed, closing channel");
                break;
            }
            None => break,
        }
    }

    // Dropping the lane senders lets the dispatch tasks drain and finish.
    drop(lanes);
    channel.closed.cancel();
    listeners.handle_close(&channel).await;
}
