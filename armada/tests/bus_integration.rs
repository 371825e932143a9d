//! Channel-message bus and chunked transfer across two live nodes.

mod common;

use armada::messaging::{
    ChannelMessage, ChannelMessageTarget, ClusterChannelAccess, InboundContext, MessageHandler,
};
use armada::network::chunk::{ChunkSessionHandler, ChunkSessionInfo, ChunkedPacketSender};
use async_trait::async_trait;
use bytes::Bytes;
use common::{start_node_a, start_node_b, wait_for_ready, wait_until};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Pong {
    tag: &'static str,
}

#[async_trait]
impl MessageHandler for Pong {
    async fn handle(&self, message: &ChannelMessage, _context: &InboundContext) -> Option<Bytes> {
        if message.message == "ping" {
            Some(Bytes::from(self.tag.as_bytes().to_vec()))
        } else {
            None
        }
    }
}

struct Collect {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageHandler for Collect {
    async fn handle(&self, message: &ChannelMessage, _context: &InboundContext) -> Option<Bytes> {
        self.seen
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&message.content).to_string());
        None
    }
}

#[tokio::test]
async fn test_query_both_nodes_returns_two_replies() {
    let cluster = start_node_a().await;
    let (node_b, _dir_b) = start_node_b(&cluster).await;
    assert!(wait_for_ready(&cluster.node_a, &node_b).await);

    cluster
        .node_a
        .messenger()
        .subscribe("probe", None, Arc::new(Pong { tag: "from-a" }));
    node_b
        .messenger()
        .subscribe("probe", None, Arc::new(Pong { tag: "from-b" }));

    let query = ChannelMessage::builder()
        .target(ChannelMessageTarget::Node("node-a".to_string()))
        .target(ChannelMessageTarget::Node("node-b".to_string()))
        .channel("probe")
        .message("ping")
        .as_query()
        .build();
    let result = cluster
        .node_a
        .messenger()
        .send_query(query, Duration::from_secs(5))
        .await;

    assert!(!result.timed_out);
    assert_eq!(result.replies.len(), 2);
    let mut tags: Vec<String> = result
        .replies
        .iter()
        .map(|r| String::from_utf8_lossy(&r.content).to_string())
        .collect();
    tags.sort();
    assert_eq!(tags, vec!["from-a".to_string(), "from-b".to_string()]);

    node_b.shutdown_handler().shutdown().await;
    cluster.node_a.shutdown_handler().shutdown().await;
}

#[tokio::test]
async fn test_query_to_missing_service_is_empty_not_an_error() {
    let cluster = start_node_a().await;

    let query = ChannelMessage::builder()
        .target(ChannelMessageTarget::Service("missing-1".to_string()))
        .channel("probe")
        .message("ping")
        .as_query()
        .build();
    let result = cluster
        .node_a
        .messenger()
        .send_query(query, Duration::from_millis(500))
        .await;

    assert!(result.replies.is_empty());

    cluster.node_a.shutdown_handler().shutdown().await;
}

#[tokio::test]
async fn test_messages_preserve_per_target_order() {
    let cluster = start_node_a().await;
    let (node_b, _dir_b) = start_node_b(&cluster).await;
    assert!(wait_for_ready(&cluster.node_a, &node_b).await);

    let seen = Arc::new(Mutex::new(Vec::new()));
    node_b.messenger().subscribe(
        "ordering",
        None,
        Arc::new(Collect {
            seen: Arc::clone(&seen),
        }),
    );

    for i in 0..20 {
        let message = ChannelMessage::builder()
            .target(ChannelMessageTarget::Node("node-b".to_string()))
            .channel("ordering")
            .message("seq")
            .content(Bytes::from(format!("{i}")))
            .build();
        cluster.node_a.messenger().send(message).await;
    }

    let seen_wait = Arc::clone(&seen);
    assert!(
        wait_until(Duration::from_secs(5), move || {
            let seen = Arc::clone(&seen_wait);
            async move { seen.lock().unwrap().len() == 20 }
        })
        .await,
        "not all messages arrived"
    );
    let expected: Vec<String> = (0..20).map(|i| format!("{i}")).collect();
    assert_eq!(*seen.lock().unwrap(), expected);

    node_b.shutdown_handler().shutdown().await;
    cluster.node_a.shutdown_handler().shutdown().await;
}

struct FileCapture {
    received: Arc<Mutex<Option<(ChunkSessionInfo, Vec<u8>)>>>,
}

#[async_trait]
impl ChunkSessionHandler for FileCapture {
    async fn session_complete(&self, info: ChunkSessionInfo, staged_file: &Path) {
        let data = std::fs::read(staged_file).unwrap();
        *self.received.lock().unwrap() = Some((info, data));
    }
}

#[tokio::test]
async fn test_chunked_transfer_across_nodes() {
    let cluster = start_node_a().await;
    let (node_b, _dir_b) = start_node_b(&cluster).await;
    assert!(wait_for_ready(&cluster.node_a, &node_b).await);

    let received = Arc::new(Mutex::new(None));
    node_b.chunk_sessions().register_handler(
        "template_transfer",
        Arc::new(FileCapture {
            received: Arc::clone(&received),
        }),
    );

    // 2.5 chunks worth of data: expect 3 chunk frames, last one flagged.
    let payload: Vec<u8> = (0..1_250_000u32).map(|i| (i % 251) as u8).collect();
    let channel = cluster
        .node_a
        .cluster()
        .peer_channel("node-b")
        .expect("peer channel present");

    let chunks = ChunkedPacketSender::for_stream(&payload[..])
        .transfer_channel("template_transfer")
        .chunk_size(500_000)
        .to_channels(vec![channel])
        .transfer()
        .await
        .unwrap();
    assert_eq!(chunks, 3);

    let received_wait = Arc::clone(&received);
    assert!(
        wait_until(Duration::from_secs(10), move || {
            let received = Arc::clone(&received_wait);
            async move { received.lock().unwrap().is_some() }
        })
        .await,
        "transfer never completed"
    );

    let (info, data) = received.lock().unwrap().take().unwrap();
    assert_eq!(info.chunk_count, 3);
    assert_eq!(data, payload, "file on disk must equal source bytewise");

    node_b.shutdown_handler().shutdown().await;
    cluster.node_a.shutdown_handler().shutdown().await;
}
