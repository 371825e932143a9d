//! Cluster configuration document.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::Path;
use uuid::Uuid;

/// Identity of one node process. Immutable for a running process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Cluster-wide unique id; also the head election key.
    pub unique_id: Uuid,
    /// Human-readable unique label, used in message targets and the CLI.
    pub name: String,
    /// Addresses the node's transport acceptor binds.
    pub listen_addresses: Vec<SocketAddr>,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, listen_addresses: Vec<SocketAddr>) -> Self {
        Self {
            unique_id: Uuid::new_v4(),
            name: name.into(),
            listen_addresses,
        }
    }
}

/// The persisted cluster configuration of a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: Uuid,
    pub local_node: NodeIdentity,
    #[serde(default)]
    pub remote_nodes: Vec<NodeIdentity>,
    /// Source addresses allowed to authorize as cluster peers.
    #[serde(default)]
    pub ip_whitelist: BTreeSet<String>,
    /// Alias -> address replacements applied when dialing peers.
    #[serde(default)]
    pub ip_aliases: BTreeMap<String, String>,
    /// Memory budget for services placed on this node.
    pub max_memory_mib: u64,
    /// Command used by the process runner to launch service JVMs.
    pub java_command: String,
}

impl ClusterConfig {
    /// A fresh single-node configuration listening on the default port.
    pub fn fresh(node_name: impl Into<String>) -> Self {
        let listen: SocketAddr = "0.0.0.0:1410".parse().expect("static address parses");
        let mut whitelist = BTreeSet::new();
        whitelist.insert("127.0.0.1".to_string());
        Self {
            cluster_id: Uuid::new_v4(),
            local_node: NodeIdentity::new(node_name, vec![listen]),
            remote_nodes: Vec::new(),
            ip_whitelist: whitelist,
            ip_aliases: BTreeMap::new(),
            max_memory_mib: 2048,
            java_command: "java".to_string(),
        }
    }

    /// Loads the config from `path`, failing startup on malformed content.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&content).map_err(|source| ConfigError::Invalid {
            path: path.display().to_string(),
            source,
        })
    }

    /// Loads the config from `path`, creating and persisting a fresh one
    /// if the file does not exist yet.
    pub fn load_or_create(path: &Path, node_name: &str) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load_from(path);
        }
        let config = Self::fresh(node_name);
        config.save_to(path)?;
        Ok(config)
    }

    /// Persists the config with write-then-rename.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |source: std::io::Error| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(write_error)?;

        let content = serde_json::to_vec_pretty(self).expect("config serializes");
        let mut file = tempfile::NamedTempFile::new_in(parent).map_err(write_error)?;
        std::io::Write::write_all(&mut file, &content).map_err(write_error)?;
        file.persist(path)
            .map_err(|e| write_error(e.error))?;
        Ok(())
    }

    /// Resolves an address through the alias table.
    pub fn resolve_alias<'a>(&'a self, host: &'a str) -> &'a str {
        self.ip_aliases.get(host).map(String::as_str).unwrap_or(host)
    }

    /// True if the given source address may authorize as a cluster peer.
    pub fn whitelisted(&self, address: &SocketAddr) -> bool {
        self.ip_whitelist.contains(&address.ip().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = ClusterConfig::fresh("node-1");
        config.max_memory_mib = 4096;
        config.save_to(&path).unwrap();

        let loaded = ClusterConfig::load_from(&path).unwrap();
        assert_eq!(loaded.cluster_id, config.cluster_id);
        assert_eq!(loaded.local_node.name, "node-1");
        assert_eq!(loaded.max_memory_mib, 4096);
    }

    #[test]
    fn test_load_or_create_creates_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let first = ClusterConfig::load_or_create(&path, "node-1").unwrap();
        let second = ClusterConfig::load_or_create(&path, "ignored").unwrap();
        assert_eq!(first.cluster_id, second.cluster_id);
        assert_eq!(second.local_node.name, "node-1");
    }

    #[test]
    fn test_malformed_config_is_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let result = ClusterConfig::load_from(&path);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_whitelist_and_aliases() {
        let mut config = ClusterConfig::fresh("node-1");
        config.ip_whitelist.insert("10.0.0.7".to_string());
        config
            .ip_aliases
            .insert("rack-a".to_string(), "10.0.0.7".to_string());

        assert!(config.whitelisted(&"127.0.0.1:9000".parse().unwrap()));
        assert!(config.whitelisted(&"10.0.0.7:1410".parse().unwrap()));
        assert!(!config.whitelisted(&"10.0.0.8:1410".parse().unwrap()));
        assert_eq!(config.resolve_alias("rack-a"), "10.0.0.7");
        assert_eq!(config.resolve_alias("unknown"), "unknown");
    }
}
