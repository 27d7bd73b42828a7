//! PostgreSQL document store.
//!
//! Every document lives in one `documents` table as a JSONB body next to
//! its type, revision and ordering timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

use crate::documents::{DocType, Document};
use crate::store::{DocumentStore, StoreError, StoreResult, Stored};

// Create a connection pool to PostgreSQL
pub async fn create_pool(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    info!("Connected to database");
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let store = Self::new(create_pool(database_url, max_connections).await?);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the documents table and its type/time index if missing.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                doc_type TEXT NOT NULL,
                revision BIGINT NOT NULL,
                sort_at TIMESTAMP WITH TIME ZONE NOT NULL,
                body JSONB NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_type_sort ON documents(doc_type, sort_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        debug!("documents schema ready");
        Ok(())
    }

    async fn current_revision(&self, id: &str) -> StoreResult<u64> {
        let revision: Option<i64> = sqlx::query_scalar("SELECT revision FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        revision.map_or(Ok(0), revision_from_db)
    }
}

fn revision_from_db(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Backend(format!("negative revision {}", value)))
}

fn revision_to_db(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Backend(format!("revision {} out of range", value)))
}

fn stored_from_row(row: &PgRow) -> StoreResult<Stored> {
    let revision = revision_from_db(row.try_get("revision")?)?;
    let Json(doc): Json<Document> = row.try_get("body")?;
    Ok(Stored { revision, doc })
}

struct Columns<'a> {
    id: &'a str,
    doc_type: &'static str,
    sort_at: DateTime<Utc>,
}

fn columns(doc: &Document) -> Columns<'_> {
    Columns {
        id: doc.id(),
        doc_type: doc.doc_type().as_str(),
        sort_at: doc.sort_at(),
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn put(&self, doc: Document) -> StoreResult<Stored> {
        let cols = columns(&doc);
        let revision: i64 = sqlx::query_scalar(
            "INSERT INTO documents (id, doc_type, revision, sort_at, body)
             VALUES ($1, $2, 1, $3, $4)
             ON CONFLICT (id)
             DO UPDATE SET
                doc_type = EXCLUDED.doc_type,
                sort_at = EXCLUDED.sort_at,
                body = EXCLUDED.body,
                revision = documents.revision + 1,
                updated_at = NOW()
             RETURNING revision",
        )
        .bind(cols.id)
        .bind(cols.doc_type)
        .bind(cols.sort_at)
        .bind(Json(&doc))
        .fetch_one(&self.pool)
        .await?;

        Ok(Stored {
            revision: revision_from_db(revision)?,
            doc,
        })
    }

    async fn put_if_revision(&self, doc: Document, expected: u64) -> StoreResult<Stored> {
        let cols = columns(&doc);
        let written: Option<i64> = if expected == 0 {
            sqlx::query_scalar(
                "INSERT INTO documents (id, doc_type, revision, sort_at, body)
                 VALUES ($1, $2, 1, $3, $4)
                 ON CONFLICT (id) DO NOTHING
                 RETURNING revision",
            )
            .bind(cols.id)
            .bind(cols.doc_type)
            .bind(cols.sort_at)
            .bind(Json(&doc))
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_scalar(
                "UPDATE documents SET
                    doc_type = $2,
                    sort_at = $3,
                    body = $4,
                    revision = revision + 1,
                    updated_at = NOW()
                 WHERE id = $1 AND revision = $5
                 RETURNING revision",
            )
            .bind(cols.id)
            .bind(cols.doc_type)
            .bind(cols.sort_at)
            .bind(Json(&doc))
            .bind(revision_to_db(expected)?)
            .fetch_optional(&self.pool)
            .await?
        };

        match written {
            Some(revision) => Ok(Stored {
                revision: revision_from_db(revision)?,
                doc,
            }),
            None => {
                let found = self.current_revision(doc.id()).await?;
                Err(StoreError::Conflict {
                    id: doc.id().to_string(),
                    expected,
                    found,
                })
            }
        }
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Stored>> {
        let row = sqlx::query("SELECT revision, body FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stored_from_row).transpose()
    }

    async fn query(&self, doc_type: DocType, limit: Option<usize>) -> StoreResult<Vec<Stored>> {
        let limit = limit
            .map(|l| i64::try_from(l).map_err(|_| StoreError::Backend(format!("limit {} out of range", l))))
            .transpose()?;

        // LIMIT NULL is LIMIT ALL
        let rows = sqlx::query(
            "SELECT revision, body FROM documents
             WHERE doc_type = $1
             ORDER BY sort_at DESC
             LIMIT $2",
        )
        .bind(doc_type.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stored_from_row).collect()
    }
}
