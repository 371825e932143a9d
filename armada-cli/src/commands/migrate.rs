//! The `migrate database` command.

use crate::error::CliError;
use armada::database::{DatabaseProvider, JsonFileDatabaseProvider, MemoryDatabaseProvider};
use armada::registry::ServiceRegistry;
use clap::Subcommand;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Copy every database from one provider into another
    Database {
        /// Source provider name
        from: String,

        /// Target provider name
        to: String,

        /// Documents read per chunk
        #[arg(long)]
        chunk_size: Option<usize>,
    },
}

pub async fn execute(state_dir: PathBuf, command: MigrateCommands) -> Result<(), CliError> {
    let MigrateCommands::Database {
        from,
        to,
        chunk_size,
    } = command;

    if from == to {
        return Err(CliError::InvalidArguments(
            "source and target provider must differ".to_string(),
        ));
    }
    let chunk_size = match chunk_size {
        Some(size) if size == 0 => {
            return Err(CliError::InvalidArguments(
                "chunk size must be positive".to_string(),
            ))
        }
        Some(size) => size,
        None => DEFAULT_CHUNK_SIZE,
    };

    let registry = provider_registry(&state_dir);
    let source = resolve_provider(&registry, &from)?;
    let target = resolve_provider(&registry, &to)?;

    source
        .init()
        .map_err(|e| CliError::Failure(format!("source init failed: {e}")))?;
    target
        .init()
        .map_err(|e| CliError::Failure(format!("target init failed: {e}")))?;

    let names = source
        .database_names()
        .map_err(|e| CliError::Failure(e.to_string()))?;
    for name in names {
        println!("migrating database {name}");
        let source_db = source.database(&name);
        let target_db = target.database(&name);

        source_db
            .iterate(
                &mut |key, document| {
                    target_db.insert(key, document)?;
                    Ok(())
                },
                chunk_size,
            )
            .map_err(|e| CliError::Failure(format!("migration of {name} failed: {e}")))?;
    }

    source
        .close()
        .map_err(|e| CliError::Failure(e.to_string()))?;
    target
        .close()
        .map_err(|e| CliError::Failure(e.to_string()))?;
    println!("migration from {from} to {to} complete");
    Ok(())
}

/// Registers the providers shipped with the node. Module-provided store
/// adapters would add themselves here through service discovery.
fn provider_registry(state_dir: &std::path::Path) -> ServiceRegistry {
    let registry = ServiceRegistry::new();
    let _ = registry.register::<dyn DatabaseProvider>(
        "memory",
        Arc::new(MemoryDatabaseProvider::new()),
    );
    let json_file = Arc::new(JsonFileDatabaseProvider::new(state_dir.join("database")));
    if let Ok(registration) = registry.register::<dyn DatabaseProvider>("json-file", json_file) {
        let _ = registration.mark_as_default();
    }
    registry
}

fn resolve_provider(
    registry: &ServiceRegistry,
    name: &str,
) -> Result<Arc<dyn DatabaseProvider>, CliError> {
    registry
        .registration::<dyn DatabaseProvider>(name)
        .map(|registration| registration.instance())
        .ok_or_else(|| CliError::InvalidArguments(format!("unknown database provider {name}")))
}
