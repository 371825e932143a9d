//! JSON-file-backed database provider.
//!
//! Layout: `<root>/<database>/<key>.json`, one document per file, written
//! with the same write-then-rename discipline as the config stores.

use super::{Database, DatabaseError, DatabaseProvider, Document};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Default provider persisting documents under the node state directory.
pub struct JsonFileDatabaseProvider {
    root: PathBuf,
    databases: DashMap<String, Arc<JsonFileDatabase>>,
}

impl JsonFileDatabaseProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            databases: DashMap::new(),
        }
    }
}

impl DatabaseProvider for JsonFileDatabaseProvider {
    fn name(&self) -> &str {
        "json-file"
    }

    fn init(&self) -> Result<(), DatabaseError> {
        std::fs::create_dir_all(&self.root).map_err(|source| DatabaseError::Io {
            database: self.root.display().to_string(),
            source,
        })
    }

    fn database(&self, name: &str) -> Arc<dyn Database> {
        let db = self
            .databases
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(JsonFileDatabase {
                    name: name.to_string(),
                    dir: self.root.join(name),
                })
            })
            .value()
            .clone();
        db
    }

    fn database_names(&self) -> Result<Vec<String>, DatabaseError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(DatabaseError::Io {
                    database: self.root.display().to_string(),
                    source,
                })
            }
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn delete_database(&self, name: &str) -> Result<bool, DatabaseError> {
        self.databases.remove(name);
        let dir = self.root.join(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(DatabaseError::Io {
                database: name.to_string(),
                source,
            }),
        }
    }

    fn close(&self) -> Result<(), DatabaseError> {
        self.databases.clear();
        Ok(())
    }
}

struct JsonFileDatabase {
    name: String,
    dir: PathBuf,
}

impl JsonFileDatabase {
    fn io_error(&self, source: std::io::Error) -> DatabaseError {
        DatabaseError::Io {
            database: self.name.clone(),
            source,
        }
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Database for JsonFileDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, key: &str, document: &Document) -> Result<bool, DatabaseError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| self.io_error(e))?;
        let path = self.path_of(key);
        let existed = path.exists();

        let content = serde_json::to_vec_pretty(document).expect("document serializes");
        let mut file = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| self.io_error(e))?;
        std::io::Write::write_all(&mut file, &content).map_err(|e| self.io_error(e))?;
        file.persist(&path).map_err(|e| self.io_error(e.error))?;
        Ok(!existed)
    }

    fn get(&self, key: &str) -> Result<Option<Document>, DatabaseError> {
        let path = self.path_of(key);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };
        let document =
            serde_json::from_slice(&content).map_err(|source| DatabaseError::MalformedDocument {
                database: self.name.clone(),
                key: key.to_string(),
                source,
            })?;
        Ok(Some(document))
    }

    fn delete(&self, key: &str) -> Result<bool, DatabaseError> {
        match std::fs::remove_file(self.path_of(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, DatabaseError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        let mut keys: Vec<String> = entries
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
        keys.sort();
        Ok(keys)
    }

    fn document_count(&self) -> Result<u64, DatabaseError> {
        Ok(self.keys()?.len() as u64)
    }

    fn clear(&self) -> Result<(), DatabaseError> {
        for key in self.keys()? {
            self.delete(&key)?;
        }
        Ok(())
    }

    fn read_chunk(
        &self,
        offset: u64,
        chunk_size: usize,
    ) -> Result<Vec<(String, Document)>, DatabaseError> {
        let keys = self.keys()?;
        let mut chunk = Vec::new();
        for key in keys.into_iter().skip(offset as usize).take(chunk_size) {
            if let Some(document) = self.get(&key)? {
                chunk.push((key, document));
            }
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support;

    #[test]
    fn test_provider_contract() {
        let dir = tempfile::TempDir::new().unwrap();
        test_support::check_provider_contract(&JsonFileDatabaseProvider::new(dir.path()));
    }

    #[test]
    fn test_chunked_iteration() {
        let dir = tempfile::TempDir::new().unwrap();
        test_support::check_chunked_iteration(&JsonFileDatabaseProvider::new(dir.path()));
    }

    #[test]
    fn test_documents_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut doc = Document::new();
        doc.insert("v".to_string(), serde_json::json!(1));

        {
            let provider = JsonFileDatabaseProvider::new(dir.path());
            provider.init().unwrap();
            provider.database("state").insert("k", &doc).unwrap();
            provider.close().unwrap();
        }

        let provider = JsonFileDatabaseProvider::new(dir.path());
        provider.init().unwrap();
        assert_eq!(provider.database("state").get("k").unwrap(), Some(doc));
    }
}
