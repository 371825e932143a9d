//! Embedded key-value document stores.
//!
//! A [`DatabaseProvider`] hands out name-keyed [`Database`]s holding JSON
//! documents. The chunked [`Database::iterate`] together with
//! [`Database::insert`] forms the migration contract used by
//! `migrate database <from> <to>`: documents are read in chunks at
//! increasing offsets with a stable key order and inserted into the target.
//!
//! Two providers ship with the node and are published through the service
//! registry: an in-memory provider and a JSON-file-backed provider (the
//! default). External store adapters register additional providers under
//! their own names.

mod json_file;
mod memory;

pub use json_file::JsonFileDatabaseProvider;
pub use memory::MemoryDatabaseProvider;

use std::sync::Arc;
use thiserror::Error;

/// A stored document. Treated as an opaque JSON object by the node.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Database layer errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("I/O error in database {database}: {source}")]
    Io {
        database: String,
        source: std::io::Error,
    },

    #[error("malformed document {key} in database {database}: {source}")]
    MalformedDocument {
        database: String,
        key: String,
        source: serde_json::Error,
    },

    #[error("database provider {0} is closed")]
    ProviderClosed(String),
}

/// One name-keyed document store.
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    /// Upserts a document. Returns true if the key did not exist before.
    fn insert(&self, key: &str, document: &Document) -> Result<bool, DatabaseError>;

    fn get(&self, key: &str) -> Result<Option<Document>, DatabaseError>;

    fn contains(&self, key: &str) -> Result<bool, DatabaseError> {
        Ok(self.get(key)?.is_some())
    }

    /// Removes a document. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, DatabaseError>;

    /// All keys in stable (sorted) order.
    fn keys(&self) -> Result<Vec<String>, DatabaseError>;

    fn document_count(&self) -> Result<u64, DatabaseError>;

    fn clear(&self) -> Result<(), DatabaseError>;

    /// Reads up to `chunk_size` documents starting at `offset` in stable
    /// key order. An empty or short result means the end was reached.
    fn read_chunk(
        &self,
        offset: u64,
        chunk_size: usize,
    ) -> Result<Vec<(String, Document)>, DatabaseError>;

    /// Feeds every document to `consumer`, reading in chunks of
    /// `chunk_size` at offsets 0, chunk_size, 2*chunk_size and so on.
    fn iterate(
        &self,
        consumer: &mut dyn FnMut(&str, &Document) -> Result<(), DatabaseError>,
        chunk_size: usize,
    ) -> Result<(), DatabaseError> {
        let chunk_size = chunk_size.max(1);
        let mut offset = 0u64;
        loop {
            let chunk = self.read_chunk(offset, chunk_size)?;
            let read = chunk.len();
            for (key, document) in &chunk {
                consumer(key, document)?;
            }
            if read < chunk_size {
                return Ok(());
            }
            offset += chunk_size as u64;
        }
    }
}

/// Hands out databases by name.
pub trait DatabaseProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Opens the provider's backing resources. Idempotent.
    fn init(&self) -> Result<(), DatabaseError>;

    /// Returns the database of the given name, creating it if needed.
    fn database(&self, name: &str) -> Arc<dyn Database>;

    /// Names of all existing databases, sorted.
    fn database_names(&self) -> Result<Vec<String>, DatabaseError>;

    fn delete_database(&self, name: &str) -> Result<bool, DatabaseError>;

    /// Releases backing resources. Idempotent.
    fn close(&self) -> Result<(), DatabaseError>;
}
