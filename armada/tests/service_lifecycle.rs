//! Service lifecycle end to end, with a fake runner standing in for the
//! external process spawner.

mod common;

use armada::cluster::AuthRequest;
use armada::network::{channels, NetworkClient, Packet, PacketListenerRegistry};
use armada::node::Node;
use armada::service::{
    LaunchContext, RunningService, ServiceError, ServiceLifeCycle, ServiceRunner, ServiceTask,
};
use async_trait::async_trait;
use common::{wait_until, write_config};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Runner that, instead of spawning a process, dials the node back with
/// the wrapper authorization - exactly what a real service agent does.
struct AgentSimulatorRunner {
    launches: AtomicU32,
    fail_launch: AtomicBool,
}

impl AgentSimulatorRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicU32::new(0),
            fail_launch: AtomicBool::new(false),
        })
    }
}

struct FakeProcess {
    stopped: AtomicBool,
}

#[async_trait]
impl RunningService for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn alive(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    async fn send_command(&self, _line: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn stop(&self, _timeout: Duration) -> Result<(), ServiceError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ServiceRunner for AgentSimulatorRunner {
    async fn launch(
        &self,
        context: &LaunchContext,
        log_lines: mpsc::UnboundedSender<String>,
    ) -> Result<Box<dyn RunningService>, ServiceError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(ServiceError::RunnerFailed("simulated launch failure".to_string()));
        }

        let _ = log_lines.send(format!("{} is booting", context.service_id.name()));

        // Dial back like a real agent: connect and authorize.
        let node_address = context.node_address;
        let connection_key = context.connection_key.clone();
        let service_id = context.service_id.clone();
        tokio::spawn(async move {
            let client = NetworkClient::new(Arc::new(PacketListenerRegistry::new()));
            if let Ok(channel) = client.connect(node_address).await {
                let request = AuthRequest::ServiceToNode {
                    connection_key,
                    service_id,
                };
                let _ = channel
                    .send(Packet::with_id(channels::AUTH, 1, request.encode()))
                    .await;
            }
        });

        Ok(Box::new(FakeProcess {
            stopped: AtomicBool::new(false),
        }))
    }
}

async fn start_single_node() -> (Arc<Node>, tempfile::TempDir, Arc<AgentSimulatorRunner>) {
    let dir = tempfile::TempDir::new().unwrap();
    let identity = common::identity("node-a", 1, common::ephemeral());
    write_config(dir.path(), Uuid::new_v4(), identity, Vec::new());

    let node = Node::start(dir.path().to_path_buf(), "node-a")
        .await
        .expect("node starts");

    // Swap the runner: the fake becomes the default implementation every
    // start goes through.
    let runner = AgentSimulatorRunner::new();
    let registration = node
        .registry()
        .register::<dyn ServiceRunner>("agent-simulator", Arc::clone(&runner) as Arc<dyn ServiceRunner>)
        .unwrap();
    registration.mark_as_default().unwrap();

    (node, dir, runner)
}

async fn lifecycle_of(node: &Arc<Node>, name: &str) -> Option<ServiceLifeCycle> {
    node.services().service_by_name(name).map(|s| s.life_cycle)
}

#[tokio::test]
async fn test_create_start_stop_delete() {
    let (node, _dir, _runner) = start_single_node().await;

    let mut task = ServiceTask::new("lobby");
    task.process.max_heap_mib = 512;
    node.services().save_task(&task).await.unwrap();

    let result = node
        .services()
        .create_by_task("lobby", 1, &|_| {})
        .await
        .unwrap();
    assert!(result.failure.is_none());
    assert_eq!(result.created.len(), 1);
    assert_eq!(result.created[0].name(), "lobby-1");
    assert_eq!(result.created[0].life_cycle, ServiceLifeCycle::Prepared);

    // Start: the fake agent dials back, the lifecycle must reach RUNNING.
    node.services().start_service("lobby-1").await.unwrap();
    let running = {
        let node = Arc::clone(&node);
        wait_until(Duration::from_secs(10), move || {
            let node = Arc::clone(&node);
            async move {
                lifecycle_of(&node, "lobby-1").await == Some(ServiceLifeCycle::Running)
            }
        })
        .await
    };
    assert!(running, "service never reached RUNNING");

    let stopped = node.services().stop_service("lobby-1").await.unwrap();
    assert_eq!(stopped.life_cycle, ServiceLifeCycle::Stopped);

    let deleted = node.services().delete_service("lobby-1").await.unwrap();
    assert_eq!(deleted.life_cycle, ServiceLifeCycle::Deleted);

    // The tombstone is garbage-collected after publication.
    assert!(node.services().service_by_name("lobby-1").is_none());
    node.shutdown_handler().shutdown().await;
}

#[tokio::test]
async fn test_illegal_transition_is_noop_returning_snapshot() {
    let (node, _dir, _runner) = start_single_node().await;
    node.services()
        .save_task(&ServiceTask::new("lobby"))
        .await
        .unwrap();
    node.services()
        .create_by_task("lobby", 1, &|_| {})
        .await
        .unwrap();

    // stop on a PREPARED service: no transition, the current snapshot
    // comes back unchanged.
    let snapshot = node.services().stop_service("lobby-1").await.unwrap();
    assert_eq!(snapshot.life_cycle, ServiceLifeCycle::Prepared);

    // delete on PREPARED is off the line as well.
    let snapshot = node.services().delete_service("lobby-1").await.unwrap();
    assert_eq!(snapshot.life_cycle, ServiceLifeCycle::Prepared);

    node.shutdown_handler().shutdown().await;
}

#[tokio::test]
async fn test_task_ids_fill_lowest_free_slot() {
    let (node, _dir, _runner) = start_single_node().await;
    node.services()
        .save_task(&ServiceTask::new("lobby"))
        .await
        .unwrap();

    let result = node
        .services()
        .create_by_task("lobby", 3, &|_| {})
        .await
        .unwrap();
    let names: Vec<String> = result.created.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["lobby-1", "lobby-2", "lobby-3"]);

    // Free the middle id. Delete only runs from STOPPED, so drive lobby-2
    // through a full start/stop cycle first.
    node.services().start_service("lobby-2").await.unwrap();
    let node_wait = Arc::clone(&node);
    assert!(
        wait_until(Duration::from_secs(10), move || {
            let node = Arc::clone(&node_wait);
            async move { lifecycle_of(&node, "lobby-2").await == Some(ServiceLifeCycle::Running) }
        })
        .await
    );
    node.services().stop_service("lobby-2").await.unwrap();
    node.services().delete_service("lobby-2").await.unwrap();

    let result = node
        .services()
        .create_by_task("lobby", 1, &|_| {})
        .await
        .unwrap();
    assert_eq!(result.created[0].name(), "lobby-2");

    node.shutdown_handler().shutdown().await;
}

#[tokio::test]
async fn test_bulk_create_stops_at_first_failure() {
    let (node, _dir, _runner) = start_single_node().await;

    // Node budget fits exactly two 900 MiB services (max_memory 2048).
    let mut task = ServiceTask::new("broken");
    task.process.max_heap_mib = 900;
    node.services().save_task(&task).await.unwrap();

    let result = node
        .services()
        .create_by_task("broken", 5, &|_| {})
        .await
        .unwrap();

    assert_eq!(result.created.len(), 2, "third create must fail");
    assert!(result.failure.is_some());
    for snapshot in &result.created {
        assert_eq!(
            lifecycle_of(&node, &snapshot.name()).await,
            Some(ServiceLifeCycle::Prepared),
            "created services must stay in place"
        );
    }

    node.shutdown_handler().shutdown().await;
}

#[tokio::test]
async fn test_launch_failure_moves_to_stopped() {
    let (node, _dir, runner) = start_single_node().await;
    node.services()
        .save_task(&ServiceTask::new("lobby"))
        .await
        .unwrap();
    node.services()
        .create_by_task("lobby", 1, &|_| {})
        .await
        .unwrap();

    runner.fail_launch.store(true, Ordering::SeqCst);
    let snapshot = node.services().start_service("lobby-1").await.unwrap();
    assert_eq!(snapshot.life_cycle, ServiceLifeCycle::Stopped);

    node.shutdown_handler().shutdown().await;
}
