//! Cluster membership, head election and reconnect sync, end to end.

mod common;

use armada::cluster::NodeServerState;
use armada::event::NodeEvent;
use armada::service::ServiceTask;
use common::{start_node_a, start_node_b, wait_for_ready, wait_until};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_two_nodes_authorize_and_elect_head() {
    let cluster = start_node_a().await;
    let (node_b, _dir_b) = start_node_b(&cluster).await;

    assert!(
        wait_for_ready(&cluster.node_a, &node_b).await,
        "nodes never became READY for each other"
    );

    // A has the smaller unique id: both sides must agree it is the head.
    assert_eq!(cluster.node_a.cluster().head_name(), "node-a");
    assert!(cluster.node_a.cluster().is_head_local());
    let b_head = Arc::clone(&node_b);
    assert!(
        wait_until(Duration::from_secs(5), move || {
            let b = Arc::clone(&b_head);
            async move { b.cluster().head_name() == "node-a" }
        })
        .await,
        "node B never agreed on the head"
    );

    node_b.shutdown_handler().shutdown().await;
    cluster.node_a.shutdown_handler().shutdown().await;
}

#[tokio::test]
async fn test_head_changes_on_node_loss() {
    let cluster = start_node_a().await;
    let (node_b, _dir_b) = start_node_b(&cluster).await;
    assert!(wait_for_ready(&cluster.node_a, &node_b).await);

    // B observes the head change once A goes away.
    let head_changed = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&head_changed);
    node_b.events().register(move |event: &NodeEvent| {
        if let NodeEvent::HeadChanged { head_name } = event {
            if head_name == "node-b" {
                observed.store(true, Ordering::SeqCst);
            }
        }
    });

    cluster.node_a.shutdown_handler().shutdown().await;

    let b = Arc::clone(&node_b);
    assert!(
        wait_until(Duration::from_secs(10), move || {
            let b = Arc::clone(&b);
            async move { b.cluster().head_name() == "node-b" }
        })
        .await,
        "head never moved to node B"
    );
    assert!(head_changed.load(Ordering::SeqCst));
    assert_eq!(
        node_b
            .cluster()
            .node_server_by_name("node-a")
            .unwrap()
            .state,
        NodeServerState::Disconnected
    );

    node_b.shutdown_handler().shutdown().await;
}

#[tokio::test]
async fn test_node_loss_tombstones_its_services_everywhere() {
    let cluster = start_node_a().await;
    let (node_b, _dir_b) = start_node_b(&cluster).await;
    assert!(wait_for_ready(&cluster.node_a, &node_b).await);

    // A service pinned to B, created through B's manager.
    node_b
        .services()
        .save_task(&ServiceTask::new("lobby"))
        .await
        .unwrap();
    let result = node_b
        .services()
        .create_by_task("lobby", 1, &|configuration| {
            configuration.node = Some("node-b".to_string());
        })
        .await
        .unwrap();
    assert_eq!(result.created.len(), 1);

    // The replicated snapshot reaches A.
    let a = Arc::clone(&cluster.node_a);
    assert!(
        wait_until(Duration::from_secs(5), move || {
            let a = Arc::clone(&a);
            async move { a.services().service_by_name("lobby-1").is_some() }
        })
        .await,
        "snapshot never replicated to node A"
    );

    // Kill B: A rewrites B's services to DELETED tombstones and
    // garbage-collects them.
    node_b.shutdown_handler().shutdown().await;
    let a = Arc::clone(&cluster.node_a);
    assert!(
        wait_until(Duration::from_secs(10), move || {
            let a = Arc::clone(&a);
            async move { a.services().service_by_name("lobby-1").is_none() }
        })
        .await,
        "service of the lost node survived on node A"
    );

    cluster.node_a.shutdown_handler().shutdown().await;
}

#[tokio::test]
async fn test_reconnect_receives_authoritative_snapshot() {
    let cluster = start_node_a().await;
    let (node_b, _dir_b) = start_node_b(&cluster).await;
    assert!(wait_for_ready(&cluster.node_a, &node_b).await);

    // Kill B.
    node_b.shutdown_handler().shutdown().await;
    let a = Arc::clone(&cluster.node_a);
    assert!(
        wait_until(Duration::from_secs(10), move || {
            let a = Arc::clone(&a);
            async move {
                a.cluster()
                    .node_server_by_name("node-b")
                    .is_some_and(|n| n.state == NodeServerState::Disconnected)
            }
        })
        .await,
        "A never noticed B going away"
    );

    // While B is down, create a task on A.
    let mut task = ServiceTask::new("lobby");
    task.groups.push("g1".to_string());
    cluster
        .node_a
        .services()
        .save_task(&task)
        .await
        .expect("task saves");

    // Restart B with a fresh state directory: after auth it must hold the
    // task, pushed as part of the reconnect snapshot.
    let (node_b2, _dir_b2) = start_node_b(&cluster).await;
    assert!(wait_for_ready(&cluster.node_a, &node_b2).await);

    let b = Arc::clone(&node_b2);
    assert!(
        wait_until(Duration::from_secs(5), move || {
            let b = Arc::clone(&b);
            async move {
                b.services()
                    .task("lobby")
                    .is_some_and(|t| t.groups == vec!["g1".to_string()])
            }
        })
        .await,
        "task lobby never reached the reconnected node"
    );

    node_b2.shutdown_handler().shutdown().await;
    cluster.node_a.shutdown_handler().shutdown().await;
}
