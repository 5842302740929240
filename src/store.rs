pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use memory::MemoryStore;
pub use postgres::{build_pool, PostgresStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document \"{id}\" not found in \"{index}\":\"{collection}\"")]
    NotFound {
        index: String,
        collection: String,
        id: String,
    },

    #[error("conflict on document \"{id}\" in \"{index}\":\"{collection}\"")]
    Conflict {
        index: String,
        collection: String,
        id: String,
    },

    #[error("malformed document \"{id}\": {reason}")]
    Malformed { id: String, reason: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// A stored document: its id plus the JSON body.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: String,
    pub source: Value,
}

impl Document {
    pub fn content<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.source.clone()).map_err(|err| StoreError::Malformed {
            id: self.id.clone(),
            reason: err.to_string(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateOptions {
    /// Number of optimistic retries when a concurrent writer touched the
    /// document between read and write.
    pub retry_on_conflict: u32,
}

#[derive(Debug)]
pub struct MCreateError {
    /// Index of the failing record in the submitted batch.
    pub index: usize,
    pub reason: String,
}

/// Bulk creation returns per-record errors instead of failing wholesale.
#[derive(Debug, Default)]
pub struct MCreateResult {
    pub successes: Vec<Document>,
    pub errors: Vec<MCreateError>,
}

#[derive(Debug, Default)]
pub struct SearchResult {
    pub hits: Vec<Document>,
    pub total: usize,
}

/// Generic document database boundary. Collections are addressed by
/// (index, collection); every mutation is serialized per document by the
/// backend itself.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, index: &str, collection: &str, id: &str) -> Result<Document, StoreError>;

    /// Create a document; fails with `Conflict` if the id already exists.
    async fn create(
        &self,
        index: &str,
        collection: &str,
        id: &str,
        body: &Value,
    ) -> Result<Document, StoreError>;

    /// Shallow-merge `partial` into the stored body and return the updated
    /// document. Honors `UpdateOptions::retry_on_conflict`.
    async fn update(
        &self,
        index: &str,
        collection: &str,
        id: &str,
        partial: &Value,
        options: UpdateOptions,
    ) -> Result<Document, StoreError>;

    /// Bulk-create with generated ids; partial failure is reported per record.
    async fn m_create(
        &self,
        index: &str,
        collection: &str,
        bodies: &[Value],
    ) -> Result<MCreateResult, StoreError>;

    /// Equality search: every (field, value) pair of `query` must match the
    /// document body. An empty query matches everything.
    async fn search(
        &self,
        index: &str,
        collection: &str,
        query: &Value,
    ) -> Result<SearchResult, StoreError>;
}

pub(crate) fn shallow_merge(source: &mut Value, partial: &Value) {
    let (Value::Object(target), Value::Object(update)) = (source, partial) else {
        return;
    };
    for (key, value) in update {
        target.insert(key.clone(), value.clone());
    }
}

pub(crate) fn matches_query(source: &Value, query: &Value) -> bool {
    match query {
        Value::Object(fields) => fields
            .iter()
            .all(|(field, expected)| source.get(field) == Some(expected)),
        Value::Null => true,
        _ => false,
    }
}
