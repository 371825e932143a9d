//! Service identity and configuration types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime environment a service runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceEnvironment {
    /// A game world process players connect to.
    #[default]
    GameServer,
    /// A player-facing proxy in front of game servers.
    Proxy,
    /// Auxiliary processes (bots, queue workers, ...).
    Generic,
}

impl std::fmt::Display for ServiceEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GameServer => f.write_str("game-server"),
            Self::Proxy => f.write_str("proxy"),
            Self::Generic => f.write_str("generic"),
        }
    }
}

/// Globally unique identity of one service instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceId {
    pub unique_id: Uuid,
    pub task_name: String,
    /// Numeric suffix building the display name.
    pub name_suffix: u32,
    /// The node owning this service.
    pub node_unique_id: Uuid,
    pub environment: ServiceEnvironment,
}

impl ServiceId {
    /// Display name, `"<task>-<suffix>"`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.task_name, self.name_suffix)
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Process resources and launch arguments of a service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub max_heap_mib: u64,
    #[serde(default)]
    pub jvm_options: Vec<String>,
    #[serde(default)]
    pub process_parameters: Vec<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_heap_mib: 512,
            jvm_options: Vec::new(),
            process_parameters: Vec::new(),
        }
    }
}

/// Addresses files inside a template storage: `storage:prefix/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub storage: String,
    pub prefix: String,
    pub name: String,
}

impl ServiceTemplate {
    pub fn local(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            storage: "local".to_string(),
            prefix: prefix.into(),
            name: name.into(),
        }
    }

    /// Relative path of this template inside its storage.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.prefix, self.name)
    }
}

impl std::fmt::Display for ServiceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.storage, self.prefix, self.name)
    }
}

/// A file fetched from a URL into the service directory before start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRemoteInclusion {
    pub url: String,
    /// Destination path relative to the service directory.
    pub destination: String,
}

/// Files pushed back into a template storage when the service stops.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub template: ServiceTemplate,
    /// Glob patterns selecting files to deploy; empty selects everything.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Glob patterns excluding files from the deployment.
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// Immutable template a service instance is created from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub task_name: String,
    pub environment: ServiceEnvironment,
    /// Pins placement to one node name; `None` lets the manager choose.
    #[serde(default)]
    pub node: Option<String>,
    /// Preferred name suffix; the manager falls back to the next free one.
    #[serde(default)]
    pub task_id: Option<u32>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub inclusions: Vec<ServiceRemoteInclusion>,
    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,
    pub process: ProcessConfig,
    pub start_port: u16,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ServiceConfiguration {
    pub fn for_task(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            environment: ServiceEnvironment::default(),
            node: None,
            task_id: None,
            groups: Vec::new(),
            templates: Vec::new(),
            inclusions: Vec::new(),
            deployments: Vec::new(),
            process: ProcessConfig::default(),
            start_port: 44955,
            properties: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_name() {
        let id = ServiceId {
            unique_id: Uuid::new_v4(),
            task_name: "lobby".to_string(),
            name_suffix: 3,
            node_unique_id: Uuid::new_v4(),
            environment: ServiceEnvironment::GameServer,
        };
        assert_eq!(id.name(), "lobby-3");
    }

    #[test]
    fn test_template_display() {
        let template = ServiceTemplate::local("lobby", "default");
        assert_eq!(template.to_string(), "local:lobby/default");
        assert_eq!(template.relative_path(), "lobby/default");
    }

    #[test]
    fn test_configuration_serde_defaults() {
        let json = r#"{
            "task_name": "lobby",
            "environment": "game-server",
            "process": {"max_heap_mib": 512},
            "start_port": 44955
        }"#;
        let config: ServiceConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.task_name, "lobby");
        assert!(config.node.is_none());
        assert!(config.templates.is_empty());
        assert!(config.process.jvm_options.is_empty());
    }
}
