//! External process runner abstraction.
//!
//! Launching the actual child process (JVM, container, ...) is delegated
//! to a [`ServiceRunner`] published through the service registry, so the
//! spawning strategy can be swapped without touching the manager. The node
//! ships a plain process runner.

use super::error::ServiceError;
use super::types::{ProcessConfig, ServiceId};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Everything a runner needs to launch one service process.
pub struct LaunchContext {
    pub service_id: ServiceId,
    pub directory: PathBuf,
    /// Launcher binary, from the cluster config (`java_command`).
    pub command: String,
    pub process: ProcessConfig,
    /// Secret the in-service agent presents when dialing back.
    pub connection_key: String,
    /// Address of the owning node's transport acceptor.
    pub node_address: SocketAddr,
    pub port: u16,
}

/// Handle to a launched service process.
#[async_trait]
pub trait RunningService: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn alive(&self) -> bool;

    /// Writes a command line to the process console.
    async fn send_command(&self, line: &str) -> Result<(), ServiceError>;

    /// Stops the process: graceful request first, forced kill once the
    /// timeout elapses.
    async fn stop(&self, timeout: Duration) -> Result<(), ServiceError>;
}

/// Launches service processes.
#[async_trait]
pub trait ServiceRunner: Send + Sync {
    /// Spawns the process. Console lines must be forwarded to `log_lines`
    /// until the process exits.
    async fn launch(
        &self,
        context: &LaunchContext,
        log_lines: mpsc::UnboundedSender<String>,
    ) -> Result<Box<dyn RunningService>, ServiceError>;
}

/// Default runner spawning a local child process.
pub struct ProcessRunner;

impl ProcessRunner {
    pub const NAME: &'static str = "process";
}

#[async_trait]
impl ServiceRunner for ProcessRunner {
    async fn launch(
        &self,
        context: &LaunchContext,
        log_lines: mpsc::UnboundedSender<String>,
    ) -> Result<Box<dyn RunningService>, ServiceError> {
        let mut command = Command::new(&context.command);
        command
            .current_dir(&context.directory)
            .args(&context.process.jvm_options)
            .arg(format!("-Xmx{}M", context.process.max_heap_mib))
            .args(&context.process.process_parameters)
            .env("ARMADA_SERVICE_ID", context.service_id.unique_id.to_string())
            .env("ARMADA_SERVICE_NAME", context.service_id.name())
            .env("ARMADA_CONNECTION_KEY", &context.connection_key)
            .env("ARMADA_NODE_ADDRESS", context.node_address.to_string())
            .env("ARMADA_SERVICE_PORT", context.port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ServiceError::RunnerFailed(format!(
                "unable to spawn {} for {}: {e}",
                context.command,
                context.service_id.name()
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(stdout, log_lines.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, log_lines);
        }
        let stdin = child.stdin.take();

        debug!(service = %context.service_id.name(), pid = child.id(), "service process spawned");
        Ok(Box::new(ProcessHandle {
            pid: child.id(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
        }))
    }
}

fn spawn_line_pump<R>(reader: R, lines: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if lines.send(line).is_err() {
                break;
            }
        }
    });
}

struct ProcessHandle {
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
}

#[async_trait]
impl RunningService for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn alive(&self) -> bool {
        // Conservative: alive until stop() reaped the child.
        self.child.try_lock().map(|c| c.is_some()).unwrap_or(true)
    }

    async fn send_command(&self, line: &str) -> Result<(), ServiceError> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(ServiceError::RunnerFailed(
                "service console is not writable".to_string(),
            ));
        };
        stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| ServiceError::RunnerFailed(format!("console write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ServiceError::RunnerFailed(format!("console flush failed: {e}")))
    }

    async fn stop(&self, timeout: Duration) -> Result<(), ServiceError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        // Graceful stop request on the console, forced kill afterwards.
        let _ = self.send_command("stop").await;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "service process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(ServiceError::RunnerFailed(format!("wait failed: {e}"))),
            Err(_) => {
                warn!(pid = self.pid, "service did not stop in time, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| ServiceError::RunnerFailed(format!("kill failed: {e}")))
            }
        }
    }
}
