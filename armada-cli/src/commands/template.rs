//! The `template` command.

use crate::error::CliError;
use crate::runner::CliRunner;
use armada::service::ServiceTemplate;
use armada::template::{collect_relative_files, TemplateStorage};
use clap::Subcommand;

#[derive(Subcommand)]
pub enum TemplateCommands {
    /// List all templates of the local storage
    List,

    /// Create an empty template (`storage:prefix/name`)
    Create { template: String },

    /// Delete a template (`storage:prefix/name`)
    Delete { template: String },

    /// Copy a template to another path
    Copy { from: String, to: String },
}

pub async fn execute(runner: &CliRunner, command: TemplateCommands) -> Result<(), CliError> {
    runner
        .with_node(|node| async move {
            match command {
                TemplateCommands::List => {
                    for registration in node
                        .registry()
                        .registrations::<dyn TemplateStorage>()
                    {
                        let storage = registration.instance();
                        for template in storage.templates() {
                            println!("{template}");
                        }
                    }
                    Ok(())
                }
                TemplateCommands::Create { template } => {
                    let template = parse_template(&template)?;
                    let storage = resolve_storage(&node, &template)?;
                    if storage
                        .create_template(&template)
                        .map_err(|e| CliError::Failure(e.to_string()))?
                    {
                        println!("created {template}");
                    } else {
                        println!("{template} already exists");
                    }
                    Ok(())
                }
                TemplateCommands::Delete { template } => {
                    let template = parse_template(&template)?;
                    let storage = resolve_storage(&node, &template)?;
                    if storage
                        .delete_template(&template)
                        .map_err(|e| CliError::Failure(e.to_string()))?
                    {
                        println!("deleted {template}");
                        Ok(())
                    } else {
                        Err(CliError::Failure(format!("{template} does not exist")))
                    }
                }
                TemplateCommands::Copy { from, to } => {
                    let from = parse_template(&from)?;
                    let to = parse_template(&to)?;
                    let source = resolve_storage(&node, &from)?;
                    let target = resolve_storage(&node, &to)?;

                    // Stage into a scratch dir, then push into the target.
                    let staging = tempfile::TempDir::new()
                        .map_err(|e| CliError::Failure(e.to_string()))?;
                    source
                        .copy_template_into(&from, staging.path())
                        .map_err(|e| CliError::Failure(e.to_string()))?;
                    target
                        .create_template(&to)
                        .map_err(|e| CliError::Failure(e.to_string()))?;
                    let files = collect_relative_files(staging.path())
                        .map_err(|e| CliError::Failure(e.to_string()))?;
                    let written = target
                        .deploy_into_template(&to, staging.path(), &files)
                        .map_err(|e| CliError::Failure(e.to_string()))?;
                    println!("copied {from} -> {to} ({written} files)");
                    Ok(())
                }
            }
        })
        .await
}

/// Parses `storage:prefix/name`; the storage part defaults to `local`.
fn parse_template(raw: &str) -> Result<ServiceTemplate, CliError> {
    let (storage, path) = match raw.split_once(':') {
        Some((storage, path)) => (storage.to_string(), path),
        None => ("local".to_string(), raw),
    };
    let (prefix, name) = path.split_once('/').ok_or_else(|| {
        CliError::InvalidArguments(format!("template must be storage:prefix/name, got {raw}"))
    })?;
    if prefix.is_empty() || name.is_empty() {
        return Err(CliError::InvalidArguments(format!(
            "template must be storage:prefix/name, got {raw}"
        )));
    }
    Ok(ServiceTemplate {
        storage,
        prefix: prefix.to_string(),
        name: name.to_string(),
    })
}

fn resolve_storage(
    node: &std::sync::Arc<armada::node::Node>,
    template: &ServiceTemplate,
) -> Result<std::sync::Arc<dyn TemplateStorage>, CliError> {
    node.registry()
        .registration::<dyn TemplateStorage>(&template.storage)
        .map(|registration| registration.instance())
        .ok_or_else(|| {
            CliError::InvalidArguments(format!("unknown template storage {}", template.storage))
        })
}
