//! Filesystem layout of a node's state directory.

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Well-known locations under the node state directory.
///
/// The temp directory is unique per process and deleted during shutdown.
#[derive(Clone, Debug)]
pub struct NodePaths {
    root: PathBuf,
    temp: PathBuf,
}

impl NodePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let temp = root.join(".temp").join(Uuid::new_v4().to_string());
        Self { root, temp }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The cluster configuration document.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Per-entity service task documents.
    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    /// Per-entity group documents.
    pub fn groups_dir(&self) -> PathBuf {
        self.root.join("groups")
    }

    /// Root of the local template storage.
    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    /// Working directories of local services.
    pub fn services_dir(&self) -> PathBuf {
        self.root.join("services")
    }

    /// Root of the local file database provider.
    pub fn database_dir(&self) -> PathBuf {
        self.root.join("database")
    }

    /// Per-process temp directory (chunk staging and friends).
    pub fn temp_dir(&self) -> &Path {
        &self.temp
    }

    /// Removes the per-process temp directory.
    pub fn delete_temp_dir(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.temp) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dir_is_process_unique() {
        let a = NodePaths::new("/tmp/armada");
        let b = NodePaths::new("/tmp/armada");
        assert_ne!(a.temp_dir(), b.temp_dir());
        assert!(a.temp_dir().starts_with("/tmp/armada/.temp"));
    }

    #[test]
    fn test_delete_missing_temp_dir_is_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = NodePaths::new(dir.path());
        paths.delete_temp_dir().unwrap();
    }
}
