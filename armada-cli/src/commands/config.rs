//! The `config` command.

use crate::error::CliError;
use crate::runner::CliRunner;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Re-read the cluster configuration from disk
    Reload,

    /// Print the configuration file location
    Path,
}

pub async fn execute(runner: &CliRunner, command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Reload => {
            runner
                .with_node(|node| async move {
                    node.reload_config()?;
                    let config = node.config().read().unwrap_or_else(|e| e.into_inner()).clone();
                    println!("configuration reloaded");
                    println!("  cluster: {}", config.cluster_id);
                    println!("  node:    {}", config.local_node.name);
                    println!("  peers:   {}", config.remote_nodes.len());
                    Ok(())
                })
                .await
        }
        ConfigCommands::Path => {
            println!("{}", runner.state_dir().join("config.json").display());
            Ok(())
        }
    }
}
