//! Generic per-entity JSON document store.

use super::ConfigError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Stores one JSON document per named entity under a directory.
///
/// Used for service tasks and group configurations, which must be kept
/// identical on every node - the documents are what data sync replicates.
pub struct EntityStore<T> {
    dir: PathBuf,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> EntityStore<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _entity: PhantomData,
        }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Persists an entity with write-then-rename.
    pub fn save(&self, name: &str, entity: &T) -> Result<(), ConfigError> {
        let path = self.path_of(name);
        let write_error = |source: std::io::Error| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(write_error)?;
        let content = serde_json::to_vec_pretty(entity).expect("entity serializes");
        let mut file = tempfile::NamedTempFile::new_in(&self.dir).map_err(write_error)?;
        std::io::Write::write_all(&mut file, &content).map_err(write_error)?;
        file.persist(&path).map_err(|e| write_error(e.error))?;
        Ok(())
    }

    /// Loads a single entity, `None` if absent.
    pub fn load(&self, name: &str) -> Result<Option<T>, ConfigError> {
        let path = self.path_of(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let entity = serde_json::from_slice(&content).map_err(|source| ConfigError::Invalid {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(entity))
    }

    /// Removes the entity document. Returns whether it existed.
    pub fn delete(&self, name: &str) -> Result<bool, ConfigError> {
        let path = self.path_of(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ConfigError::Write {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Names of all stored entities, sorted.
    pub fn names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    path.file_stem().map(|s| s.to_string_lossy().to_string())
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names
    }

    /// Loads every stored entity, skipping malformed documents.
    pub fn load_all(&self) -> Vec<T> {
        self.names()
            .iter()
            .filter_map(|name| self.load(name).ok().flatten())
            .collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        weight: u32,
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let store: EntityStore<Doc> = EntityStore::new(dir.path());

        let doc = Doc {
            name: "lobby".to_string(),
            weight: 3,
        };
        store.save("lobby", &doc).unwrap();

        assert_eq!(store.load("lobby").unwrap(), Some(doc));
        assert_eq!(store.names(), vec!["lobby".to_string()]);
        assert!(store.delete("lobby").unwrap());
        assert!(!store.delete("lobby").unwrap());
        assert_eq!(store.load("lobby").unwrap(), None);
    }

    #[test]
    fn test_load_all_skips_malformed() {
        let dir = tempfile::TempDir::new().unwrap();
        let store: EntityStore<Doc> = EntityStore::new(dir.path());
        store
            .save(
                "ok",
                &Doc {
                    name: "ok".to_string(),
                    weight: 1,
                },
            )
            .unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{").unwrap();

        let all = store.load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "ok");
    }
}
