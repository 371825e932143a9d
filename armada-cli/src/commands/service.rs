//! The `service` command.

use crate::error::CliError;
use crate::runner::CliRunner;
use armada::service::{CloudServiceManager, ScreenTarget, ServiceInfoSnapshot};
use glob::Pattern;
use std::sync::Arc;
use std::time::Duration;

/// Seconds a `screen` session tails the service console.
const SCREEN_TAIL_SECS: u64 = 10;

pub async fn execute(
    runner: &CliRunner,
    pattern: String,
    action: Vec<String>,
) -> Result<(), CliError> {
    runner
        .with_node(|node| async move {
            let manager = node.services();

            if pattern == "list" {
                if !action.is_empty() {
                    return Err(CliError::InvalidArguments(
                        "service list takes no further arguments".to_string(),
                    ));
                }
                print_service_list(&manager.services());
                return Ok(());
            }

            let matches = match_services(manager, &pattern)?;
            if matches.is_empty() {
                return Err(CliError::Failure(format!(
                    "no service matches {pattern}"
                )));
            }

            let mut action = action.into_iter();
            let verb = action.next();
            match verb.as_deref() {
                None => {
                    for snapshot in &matches {
                        print_service(snapshot);
                    }
                    Ok(())
                }
                Some("start") => lifecycle_op(manager, &matches, "start").await,
                Some("stop") => lifecycle_op(manager, &matches, "stop").await,
                Some("restart") => lifecycle_op(manager, &matches, "restart").await,
                Some("delete") => lifecycle_op(manager, &matches, "delete").await,
                Some("copy") => {
                    for snapshot in &matches {
                        let deployed = manager.deploy_service(&snapshot.name()).await?;
                        println!("deployed {}", deployed.name());
                    }
                    Ok(())
                }
                Some("cmd") => {
                    let line: Vec<String> = action.collect();
                    if line.is_empty() {
                        return Err(CliError::InvalidArguments(
                            "cmd needs a command line".to_string(),
                        ));
                    }
                    let line = line.join(" ");
                    for snapshot in &matches {
                        manager.send_command_line(&snapshot.name(), &line).await?;
                        println!("sent to {}", snapshot.name());
                    }
                    Ok(())
                }
                Some("screen") => {
                    let name = matches[0].name();
                    tail_screen(manager, &name).await
                }
                Some(other) => Err(CliError::InvalidArguments(format!(
                    "unknown service action {other}"
                ))),
            }
        })
        .await
}

fn match_services(
    manager: &Arc<CloudServiceManager>,
    pattern: &str,
) -> Result<Vec<ServiceInfoSnapshot>, CliError> {
    let compiled = Pattern::new(pattern)
        .map_err(|e| CliError::InvalidArguments(format!("bad pattern {pattern}: {e}")))?;
    Ok(manager
        .services()
        .into_iter()
        .filter(|s| compiled.matches(&s.name()))
        .collect())
}

async fn lifecycle_op(
    manager: &Arc<CloudServiceManager>,
    services: &[ServiceInfoSnapshot],
    op: &str,
) -> Result<(), CliError> {
    for snapshot in services {
        let name = snapshot.name();
        let after = match op {
            "start" => manager.start_service(&name).await?,
            "stop" => manager.stop_service(&name).await?,
            "restart" => manager.restart_service(&name).await?,
            "delete" => manager.delete_service(&name).await?,
            _ => unreachable!("verbs are matched by the caller"),
        };
        println!("{} -> {}", name, after.life_cycle);
    }
    Ok(())
}

async fn tail_screen(manager: &Arc<CloudServiceManager>, name: &str) -> Result<(), CliError> {
    let (sink, mut lines) = tokio::sync::mpsc::unbounded_channel();
    let token = armada::service::manager::next_screen_token();
    manager
        .toggle_screen(name, ScreenTarget::Local { token, sink })
        .await?;

    println!("screen of {name} (backlog first, {SCREEN_TAIL_SECS}s tail):");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(SCREEN_TAIL_SECS);
    loop {
        match tokio::time::timeout_at(deadline, lines.recv()).await {
            Ok(Some(line)) => println!("[{name}] {line}"),
            Ok(None) | Err(_) => break,
        }
    }
    Ok(())
}

fn print_service_list(services: &[ServiceInfoSnapshot]) {
    println!(
        "{:<20} {:<12} {:<20} {:<10}",
        "NAME", "LIFECYCLE", "NODE", "PORT"
    );
    for snapshot in services {
        println!(
            "{:<20} {:<12} {:<20} {:<10}",
            snapshot.name(),
            snapshot.life_cycle.to_string(),
            snapshot.service_id.node_unique_id,
            snapshot.address.port()
        );
    }
}

fn print_service(snapshot: &ServiceInfoSnapshot) {
    println!("{}:", snapshot.name());
    println!("  lifecycle:  {}", snapshot.life_cycle);
    println!("  task:       {}", snapshot.service_id.task_name);
    println!("  node:       {}", snapshot.service_id.node_unique_id);
    println!("  address:    {}", snapshot.address);
    println!("  created:    {} ms", snapshot.creation_time_ms);
    if let Some(pid) = snapshot.process_snapshot.pid {
        println!("  pid:        {pid}");
    }
}
