use super::{
    shallow_merge, Document, DocumentStore, MCreateError, MCreateResult, SearchResult, StoreError,
    UpdateOptions,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn build_pool(database_url: &str, pool_size: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(pool_size)
        .connect(database_url)
        .await
        .map_err(backend)
}

/// Document store on a single Postgres JSONB table. One row per document,
/// keyed by (index, collection, id); the version column backs optimistic
/// retry-on-conflict for updates.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                index_name text NOT NULL,
                collection text NOT NULL,
                id text NOT NULL,
                source jsonb NOT NULL,
                version bigint NOT NULL DEFAULT 1,
                updated_at timestamptz NOT NULL DEFAULT now(),
                PRIMARY KEY (index_name, collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn get(&self, index: &str, collection: &str, id: &str) -> Result<Document, StoreError> {
        let row: Option<(SqlJson<Value>,)> = sqlx::query_as(
            "SELECT source FROM documents WHERE index_name = $1 AND collection = $2 AND id = $3",
        )
        .bind(index)
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some((SqlJson(source),)) => Ok(Document {
                id: id.to_string(),
                source,
            }),
            None => Err(StoreError::NotFound {
                index: index.to_string(),
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn create(
        &self,
        index: &str,
        collection: &str,
        id: &str,
        body: &Value,
    ) -> Result<Document, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (index_name, collection, id, source)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (index_name, collection, id) DO NOTHING
            "#,
        )
        .bind(index)
        .bind(collection)
        .bind(id)
        .bind(SqlJson(body.clone()))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                index: index.to_string(),
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
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
        options: UpdateOptions,
    ) -> Result<Document, StoreError> {
        let mut attempts = 0u32;
        loop {
            let row: Option<(SqlJson<Value>, i64)> = sqlx::query_as(
                r#"
                SELECT source, version
                FROM documents
                WHERE index_name = $1 AND collection = $2 AND id = $3
                "#,
            )
            .bind(index)
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

            let Some((SqlJson(mut source), version)) = row else {
                return Err(StoreError::NotFound {
                    index: index.to_string(),
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            };
            shallow_merge(&mut source, partial);

            let result = sqlx::query(
                r#"
                UPDATE documents
                SET source = $4, version = version + 1, updated_at = now()
                WHERE index_name = $1 AND collection = $2 AND id = $3 AND version = $5
                "#,
            )
            .bind(index)
            .bind(collection)
            .bind(id)
            .bind(SqlJson(source.clone()))
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

            if result.rows_affected() > 0 {
                return Ok(Document {
                    id: id.to_string(),
                    source,
                });
            }

            attempts += 1;
            if attempts > options.retry_on_conflict {
                return Err(StoreError::Conflict {
                    index: index.to_string(),
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            tracing::debug!(
                index,
                collection,
                id,
                attempts,
                "document version conflict; retrying update"
            );
        }
    }

    async fn m_create(
        &self,
        index: &str,
        collection: &str,
        bodies: &[Value],
    ) -> Result<MCreateResult, StoreError> {
        let mut result = MCreateResult::default();
        for (position, body) in bodies.iter().enumerate() {
            let id = Uuid::new_v4().to_string();
            let inserted = sqlx::query(
                r#"
                INSERT INTO documents (index_name, collection, id, source)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (index_name, collection, id) DO NOTHING
                "#,
            )
            .bind(index)
            .bind(collection)
            .bind(&id)
            .bind(SqlJson(body.clone()))
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(outcome) if outcome.rows_affected() > 0 => {
                    result.successes.push(Document {
                        id,
                        source: body.clone(),
                    });
                }
                Ok(_) => result.errors.push(MCreateError {
                    index: position,
                    reason: format!("document \"{id}\" already exists"),
                }),
                Err(err) => result.errors.push(MCreateError {
                    index: position,
                    reason: err.to_string(),
                }),
            }
        }
        Ok(result)
    }

    async fn search(
        &self,
        index: &str,
        collection: &str,
        query: &Value,
    ) -> Result<SearchResult, StoreError> {
        let rows: Vec<(String, SqlJson<Value>)> = sqlx::query_as(
            r#"
            SELECT id, source
            FROM documents
            WHERE index_name = $1 AND collection = $2 AND source @> $3
            "#,
        )
        .bind(index)
        .bind(collection)
        .bind(SqlJson(query.clone()))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let hits: Vec<Document> = rows
            .into_iter()
            .map(|(id, SqlJson(source))| Document { id, source })
            .collect();
        let total = hits.len();
        Ok(SearchResult { hits, total })
    }
}
