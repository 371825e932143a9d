//! Declarative service task and group definitions.
//!
//! Tasks and groups are disk-persisted documents kept identical on every
//! node by data sync. A service is built from its task merged with the
//! contributions of every group the task belongs to.

use super::types::{
    ProcessConfig, ServiceConfiguration, ServiceDeployment, ServiceEnvironment,
    ServiceRemoteInclusion, ServiceTemplate,
};
use serde::{Deserialize, Serialize};

/// Named template from which services are created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceTask {
    pub name: String,
    pub environment: ServiceEnvironment,
    /// A task in maintenance is skipped by automatic starts.
    #[serde(default)]
    pub maintenance: bool,
    /// Node names this task may be placed on; empty means anywhere.
    #[serde(default)]
    pub associated_nodes: Vec<String>,
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
    pub min_service_count: u32,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ServiceTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment: ServiceEnvironment::default(),
            maintenance: false,
            associated_nodes: Vec::new(),
            groups: Vec::new(),
            templates: Vec::new(),
            inclusions: Vec::new(),
            deployments: Vec::new(),
            process: ProcessConfig::default(),
            start_port: 44955,
            min_service_count: 0,
            properties: serde_json::Map::new(),
        }
    }

    /// Builds a service configuration from this task, merging in every
    /// matching group's templates, inclusions, deployments and process
    /// arguments.
    pub fn to_configuration(&self, groups: &[GroupConfiguration]) -> ServiceConfiguration {
        let mut config = ServiceConfiguration {
            task_name: self.name.clone(),
            environment: self.environment,
            node: None,
            task_id: None,
            groups: self.groups.clone(),
            templates: self.templates.clone(),
            inclusions: self.inclusions.clone(),
            deployments: self.deployments.clone(),
            process: self.process.clone(),
            start_port: self.start_port,
            properties: self.properties.clone(),
        };

        for group in groups {
            if !group.applies_to(self) {
                continue;
            }
            config.templates.extend(group.templates.iter().cloned());
            config.inclusions.extend(group.inclusions.iter().cloned());
            config.deployments.extend(group.deployments.iter().cloned());
            config
                .process
                .jvm_options
                .extend(group.jvm_options.iter().cloned());
            config
                .process
                .process_parameters
                .extend(group.process_parameters.iter().cloned());
        }

        config
    }
}

/// Named tag grouping tasks and services for bulk targeting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupConfiguration {
    pub name: String,
    #[serde(default)]
    pub jvm_options: Vec<String>,
    #[serde(default)]
    pub process_parameters: Vec<String>,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub inclusions: Vec<ServiceRemoteInclusion>,
    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,
    /// Environments this group applies to implicitly, in addition to tasks
    /// naming the group explicitly.
    #[serde(default)]
    pub target_environments: Vec<ServiceEnvironment>,
}

impl GroupConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jvm_options: Vec::new(),
            process_parameters: Vec::new(),
            templates: Vec::new(),
            inclusions: Vec::new(),
            deployments: Vec::new(),
            target_environments: Vec::new(),
        }
    }

    /// Whether this group contributes to services of the given task.
    pub fn applies_to(&self, task: &ServiceTask) -> bool {
        task.groups.contains(&self.name) || self.target_environments.contains(&task.environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_merges_matching_groups() {
        let mut task = ServiceTask::new("lobby");
        task.groups.push("global".to_string());
        task.templates.push(ServiceTemplate::local("lobby", "default"));

        let mut global = GroupConfiguration::new("global");
        global.templates.push(ServiceTemplate::local("all", "base"));
        global.jvm_options.push("-XX:+UseZGC".to_string());

        let mut unrelated = GroupConfiguration::new("other");
        unrelated.templates.push(ServiceTemplate::local("x", "y"));

        let config = task.to_configuration(&[global, unrelated]);
        assert_eq!(config.templates.len(), 2);
        assert_eq!(config.process.jvm_options, vec!["-XX:+UseZGC".to_string()]);
    }

    #[test]
    fn test_group_applies_by_environment() {
        let task = ServiceTask::new("lobby");

        let mut group = GroupConfiguration::new("servers");
        group.target_environments.push(ServiceEnvironment::GameServer);
        assert!(group.applies_to(&task));

        let mut proxies = GroupConfiguration::new("proxies");
        proxies.target_environments.push(ServiceEnvironment::Proxy);
        assert!(!proxies.applies_to(&task));
    }
}
