use super::{
    matches_query, shallow_merge, Document, DocumentStore, MCreateError, MCreateResult,
    SearchResult, StoreError, UpdateOptions,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory document store. Backs hermetic pipeline tests and local runs
/// without Postgres; mutations are serialized by the collection lock.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<(String, String), HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(index: &str, collection: &str) -> (String, String) {
        (index.to_string(), collection.to_string())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, index: &str, collection: &str, id: &str) -> Result<Document, StoreError> {
        let collections = self.collections.read().await;
        collections
            .get(&Self::key(index, collection))
            .and_then(|docs| docs.get(id))
            .map(|source| Document {
                id: id.to_string(),
                source: source.clone(),
            })
            .ok_or_else(|| StoreError::NotFound {
                index: index.to_string(),
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    async fn create(
        &self,
        index: &str,
        collection: &str,
        id: &str,
        body: &Value,
    ) -> Result<Document, StoreError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(Self::key(index, collection)).or_default();
        if docs.contains_key(id) {
            return Err(StoreError::Conflict {
                index: index.to_string(),
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        docs.insert(id.to_string(), body.clone());
        Ok(Document {
            id: id.to_string(),
            source: body.clone(),
        })
    }

    async fn update(
        &self,
        index: &str,
        collection: &str,
        id: &str,
        partial: &Value,
        _options: UpdateOptions,
    ) -> Result<Document, StoreError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(Self::key(index, collection)).or_default();
        let source = docs.get_mut(id).ok_or_else(|| StoreError::NotFound {
            index: index.to_string(),
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        shallow_merge(source, partial);
        Ok(Document {
            id: id.to_string(),
            source: source.clone(),
        })
    }

    async fn m_create(
        &self,
        index: &str,
        collection: &str,
        bodies: &[Value],
    ) -> Result<MCreateResult, StoreError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(Self::key(index, collection)).or_default();
        let mut result = MCreateResult::default();
        for (position, body) in bodies.iter().enumerate() {
            if !body.is_object() {
                result.errors.push(MCreateError {
                    index: position,
                    reason: "document body must be an object".to_string(),
                });
                continue;
            }
            let id = Uuid::new_v4().to_string();
            docs.insert(id.clone(), body.clone());
            result.successes.push(Document {
                id,
                source: body.clone(),
            });
        }
        Ok(result)
    }

    async fn search(
        &self,
        index: &str,
        collection: &str,
        query: &Value,
    ) -> Result<SearchResult, StoreError> {
        let collections = self.collections.read().await;
        let hits: Vec<Document> = collections
            .get(&Self::key(index, collection))
            .map(|docs| {
                docs.iter()
                    .filter(|(_, source)| matches_query(source, query))
                    .map(|(id, source)| Document {
                        id: id.clone(),
                        source: source.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let total = hits.len();
        Ok(SearchResult { hits, total })
    }
}
