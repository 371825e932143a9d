//! Armada CLI - operator interface for the node.
//!
//! # Architecture
//!
//! - `Cli` / `Commands`: argument parsing (clap)
//! - `CliRunner`: common setup (logging, state dir, node boot)
//! - `CliError`: centralized error handling with process exit codes
//!   (0 success, 1 failure, 2 invalid arguments)
//!
//! The node state lives in `--dir` (default `./armada`); `armada run`
//! starts a node in the foreground, the remaining commands administer the
//! node state in that directory.

mod commands;
mod error;
mod runner;

use clap::{Parser, Subcommand};
use error::CliError;
use runner::CliRunner;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "armada")]
#[command(version = armada::VERSION)]
#[command(about = "Distributed orchestrator for game-server workloads", long_about = None)]
struct Cli {
    /// Node state directory
    #[arg(long, global = true, default_value = "armada")]
    dir: PathBuf,

    /// Node name used when creating a fresh configuration
    #[arg(long, global = true, default_value = "node-1")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node in the foreground
    Run,

    /// Create services from a task
    Create {
        #[command(subcommand)]
        create: commands::create::CreateCommands,
    },

    /// Inspect and control services
    Service {
        /// Service name or glob pattern, or `list`
        pattern: String,

        /// Action (start|stop|restart|delete|copy|cmd|screen) and its
        /// arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        action: Vec<String>,
    },

    /// Manage templates in the local storage
    Template {
        #[command(subcommand)]
        template: commands::template::TemplateCommands,
    },

    /// Migrate documents between database providers
    Migrate {
        #[command(subcommand)]
        migrate: commands::migrate::MigrateCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        config: commands::config::ConfigCommands,
    },

    /// Stop a node cleanly and verify the state directory
    Shutdown,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run => commands::run::execute(cli.dir, cli.name).await,
        Commands::Create { create } => {
            let runner = quiet_runner(cli.dir, cli.name);
            match runner {
                Ok(runner) => commands::create::execute(&runner, create).await,
                Err(e) => Err(e),
            }
        }
        Commands::Service { pattern, action } => {
            let runner = quiet_runner(cli.dir, cli.name);
            match runner {
                Ok(runner) => commands::service::execute(&runner, pattern, action).await,
                Err(e) => Err(e),
            }
        }
        Commands::Template { template } => {
            let runner = quiet_runner(cli.dir, cli.name);
            match runner {
                Ok(runner) => commands::template::execute(&runner, template).await,
                Err(e) => Err(e),
            }
        }
        Commands::Migrate { migrate } => commands::migrate::execute(cli.dir, migrate).await,
        Commands::Config { config } => {
            let runner = quiet_runner(cli.dir, cli.name);
            match runner {
                Ok(runner) => commands::config::execute(&runner, config).await,
                Err(e) => Err(e),
            }
        }
        Commands::Shutdown => {
            let runner = quiet_runner(cli.dir, cli.name);
            match runner {
                Ok(runner) => runner.with_node(|_node| async { Ok(()) }).await,
                Err(e) => Err(e),
            }
        }
    };

    if let Err(error) = result {
        error.exit();
    }
}

fn quiet_runner(dir: PathBuf, name: String) -> Result<CliRunner, CliError> {
    CliRunner::new(dir, name, false)
}
