//! Frame-oriented transport channels.
//!
//! Every connection carries length-prefixed frames tagged with a wire
//! channel id; a shared listener table routes inbound frames to the
//! subsystem owning that id. Reserved ids are defined in
//! [`packet::channels`]. Payload field encoding lives in [`wire`].

pub mod chunk;
mod channel;
mod client;
mod codec;
mod error;
mod listener;
mod packet;
mod server;
pub mod wire;

pub use channel::{ChannelAttachment, NetworkChannel};
pub use client::NetworkClient;
pub use codec::{PacketCodec, DEFAULT_MAX_FRAME_SIZE};
pub use error::NetworkError;
pub use listener::{ChannelCloseListener, PacketListener, PacketListenerRegistry};
pub use packet::{channels, Packet};
pub use server::NetworkServer;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Capture {
        tx: mpsc::UnboundedSender<Packet>,
    }

    #[async_trait]
    impl PacketListener for Capture {
        async fn handle(&self, channel: &Arc<NetworkChannel>, packet: Packet) {
            channel.mark_authorized();
            let _ = self.tx.send(packet);
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_client_to_server_frame_delivery() {
        let server_listeners = Arc::new(PacketListenerRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        server_listeners.register(channels::AUTH, Arc::new(Capture { tx }));

        let server = NetworkServer::new(Arc::clone(&server_listeners));
        let address = server.bind(loopback()).await.unwrap();

        let client = NetworkClient::new(Arc::new(PacketListenerRegistry::new()));
        let channel = client.connect(address).await.unwrap();
        channel
            .send(Packet::new(channels::AUTH, Bytes::from_static(b"auth-me")))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, channels::AUTH);
        assert_eq!(&received.payload[..], b"auth-me");

        server.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn test_unauthorized_non_auth_packets_dropped() {
        let server_listeners = Arc::new(PacketListenerRegistry::new());
        let (auth_tx, mut auth_rx) = mpsc::unbounded_channel();
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        server_listeners.register(channels::AUTH, Arc::new(Capture { tx: auth_tx }));
        server_listeners.register(channels::CHANNEL_MESSAGE, Arc::new(Capture { tx: msg_tx }));

        let server = NetworkServer::new(Arc::clone(&server_listeners));
        let address = server.bind(loopback()).await.unwrap();

        let client = NetworkClient::new(Arc::new(PacketListenerRegistry::new()));
        let channel = client.connect(address).await.unwrap();

        // Sent before authorization: must be dropped on the receiving side.
        channel
            .send(Packet::new(
                channels::CHANNEL_MESSAGE,
                Bytes::from_static(b"too-early"),
            ))
            .await
            .unwrap();
        channel
            .send(Packet::new(channels::AUTH, Bytes::from_static(b"auth")))
            .await
            .unwrap();
        channel
            .send(Packet::new(
                channels::CHANNEL_MESSAGE,
                Bytes::from_static(b"after-auth"),
            ))
            .await
            .unwrap();

        assert_eq!(&auth_rx.recv().await.unwrap().payload[..], b"auth");
        let delivered = msg_rx.recv().await.unwrap();
        assert_eq!(&delivered.payload[..], b"after-auth");

        server.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn test_send_sync_resolves_after_flush() {
        let server_listeners = Arc::new(PacketListenerRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        server_listeners.register(channels::AUTH, Arc::new(Capture { tx }));

        let server = NetworkServer::new(server_listeners);
        let address = server.bind(loopback()).await.unwrap();

        let client = NetworkClient::new(Arc::new(PacketListenerRegistry::new()));
        let channel = client.connect(address).await.unwrap();
        channel
            .send_sync(Packet::new(channels::AUTH, Bytes::from_static(b"flush")))
            .await
            .unwrap();

        assert_eq!(&rx.recv().await.unwrap().payload[..], b"flush");
        server.close().await;
        client.close().await;
    }
}
