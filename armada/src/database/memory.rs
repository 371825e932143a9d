//! In-memory database provider.

use super::{Database, DatabaseError, DatabaseProvider, Document};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Volatile provider, mainly used by migrations and tests.
#[derive(Default)]
pub struct MemoryDatabaseProvider {
    databases: DashMap<String, Arc<MemoryDatabase>>,
}

impl MemoryDatabaseProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatabaseProvider for MemoryDatabaseProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn init(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    fn database(&self, name: &str) -> Arc<dyn Database> {
        let db = self
            .databases
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryDatabase {
                    name: name.to_string(),
                    documents: RwLock::new(BTreeMap::new()),
                })
            })
            .value()
            .clone();
        db
    }

    fn database_names(&self) -> Result<Vec<String>, DatabaseError> {
        let mut names: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn delete_database(&self, name: &str) -> Result<bool, DatabaseError> {
        Ok(self.databases.remove(name).is_some())
    }

    fn close(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

struct MemoryDatabase {
    name: String,
    documents: RwLock<BTreeMap<String, Document>>,
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, key: &str, document: &Document) -> Result<bool, DatabaseError> {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        Ok(documents.insert(key.to_string(), document.clone()).is_none())
    }

    fn get(&self, key: &str) -> Result<Option<Document>, DatabaseError> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool, DatabaseError> {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        Ok(documents.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, DatabaseError> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents.keys().cloned().collect())
    }

    fn document_count(&self) -> Result<u64, DatabaseError> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents.len() as u64)
    }

    fn clear(&self) -> Result<(), DatabaseError> {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.clear();
        Ok(())
    }

    fn read_chunk(
        &self,
        offset: u64,
        chunk_size: usize,
    ) -> Result<Vec<(String, Document)>, DatabaseError> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents
            .iter()
            .skip(offset as usize)
            .take(chunk_size)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support;

    #[test]
    fn test_provider_contract() {
        test_support::check_provider_contract(&MemoryDatabaseProvider::new());
    }

    #[test]
    fn test_chunked_iteration() {
        test_support::check_chunked_iteration(&MemoryDatabaseProvider::new());
    }
}
