//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use armada::config::{ClusterConfig, NodeIdentity};
use armada::node::Node;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Polls `check` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn identity(name: &str, id_byte: u8, address: SocketAddr) -> NodeIdentity {
    NodeIdentity {
        unique_id: Uuid::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, id_byte]),
        name: name.to_string(),
        listen_addresses: vec![address],
    }
}

pub fn ephemeral() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Placeholder address for peers whose real port is not known yet; the
/// dial loop backs off against it while the peer connects inbound.
pub fn unreachable() -> SocketAddr {
    "127.0.0.1:1".parse().unwrap()
}

pub struct TestCluster {
    pub cluster_id: Uuid,
    pub node_a: Arc<Node>,
    pub dir_a: tempfile::TempDir,
    pub identity_a: NodeIdentity,
    pub identity_b: NodeIdentity,
}

/// Starts node A of a two-node cluster. Node B is started (and restarted)
/// separately via [`start_node_b`] so tests can control its life.
pub async fn start_node_a() -> TestCluster {
    let cluster_id = Uuid::new_v4();
    let identity_a = identity("node-a", 1, ephemeral());
    let identity_b = identity("node-b", 2, unreachable());

    let dir_a = tempfile::TempDir::new().unwrap();
    write_config(
        dir_a.path(),
        cluster_id,
        identity_a.clone(),
        vec![identity_b.clone()],
    );
    let node_a = Node::start(dir_a.path().to_path_buf(), "node-a")
        .await
        .expect("node A starts");

    TestCluster {
        cluster_id,
        node_a,
        dir_a,
        identity_a,
        identity_b,
    }
}

/// Starts node B dialing node A's real bound address.
pub async fn start_node_b(cluster: &TestCluster) -> (Arc<Node>, tempfile::TempDir) {
    let addr_a = cluster.node_a.bound_addresses()[0];
    let mut identity_a = cluster.identity_a.clone();
    identity_a.listen_addresses = vec![addr_a];

    let dir_b = tempfile::TempDir::new().unwrap();
    write_config(
        dir_b.path(),
        cluster.cluster_id,
        cluster.identity_b.clone(),
        vec![identity_a],
    );
    let node_b = Node::start(dir_b.path().to_path_buf(), "node-b")
        .await
        .expect("node B starts");
    (node_b, dir_b)
}

pub fn write_config(
    dir: &std::path::Path,
    cluster_id: Uuid,
    local: NodeIdentity,
    remotes: Vec<NodeIdentity>,
) {
    let mut config = ClusterConfig::fresh(&local.name);
    config.cluster_id = cluster_id;
    config.local_node = local;
    config.remote_nodes = remotes;
    config.save_to(&dir.join("config.json")).unwrap();
}

/// Waits until both sides of an A/B pair consider each other READY.
pub async fn wait_for_ready(node_a: &Arc<Node>, node_b: &Arc<Node>) -> bool {
    let a = Arc::clone(node_a);
    let b = Arc::clone(node_b);
    wait_until(Duration::from_secs(10), move || {
        let a = Arc::clone(&a);
        let b = Arc::clone(&b);
        async move {
            let a_sees_b = a
                .cluster()
                .node_server_by_name("node-b")
                .is_some_and(|n| n.available());
            let b_sees_a = b
                .cluster()
                .node_server_by_name("node-a")
                .is_some_and(|n| n.available());
            a_sees_b && b_sees_a
        }
    })
    .await
}
