//! The `create by` command.

use crate::error::CliError;
use crate::runner::CliRunner;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum CreateCommands {
    /// Create services from a named task
    By {
        /// Task name
        task: String,

        /// Number of services to create
        amount: u32,

        /// Start the created services right away
        #[arg(long)]
        start: bool,

        /// Preferred name suffix for the first created service
        #[arg(long)]
        id: Option<u32>,

        /// Override the task's max heap (MiB)
        #[arg(long)]
        memory: Option<u64>,

        /// Pin placement to one node
        #[arg(long)]
        node: Option<String>,
    },
}

pub async fn execute(runner: &CliRunner, command: CreateCommands) -> Result<(), CliError> {
    let CreateCommands::By {
        task,
        amount,
        start,
        id,
        memory,
        node,
    } = command;
    if amount == 0 {
        return Err(CliError::InvalidArguments(
            "amount must be at least 1".to_string(),
        ));
    }

    runner
        .with_node(|node_handle| async move {
            let manager = node_handle.services();
            let result = manager
                .create_by_task(&task, amount, &move |configuration| {
                    configuration.task_id = id;
                    if let Some(memory) = memory {
                        configuration.process.max_heap_mib = memory;
                    }
                    if let Some(node) = &node {
                        configuration.node = Some(node.clone());
                    }
                })
                .await?;

            for snapshot in &result.created {
                println!("created {} ({})", snapshot.name(), snapshot.life_cycle);
            }

            if start {
                for snapshot in &result.created {
                    match manager.start_service(&snapshot.name()).await {
                        Ok(started) => {
                            println!("started {} ({})", started.name(), started.life_cycle)
                        }
                        Err(error) => println!("start of {} failed: {error}", snapshot.name()),
                    }
                }
            }

            // Bulk create stops at the first failure; the services created
            // before it stay in place.
            if let Some(failure) = result.failure {
                return Err(CliError::Failure(format!(
                    "created {} of {amount} services, then failed: {failure}",
                    result.created.len()
                )));
            }
            Ok(())
        })
        .await
}
