//! Postgres-backed store.
//!
//! One `store_documents` table holds every collection, keyed by
//! `(collection, id)`. Insert-if-absent is `ON CONFLICT DO NOTHING`;
//! compare-and-set is an `UPDATE` guarded by the stored revision. Field
//! conditions compare the whole value at a path, matching `Query::matches`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::Store;
use crate::error::{Error, Result};
use crate::model::{
    Actor, Audit, DeleteState, DeletionFilter, Document, DocumentId, FindOptions, Query, SortOrder,
};

const COLUMNS: &str = "id, revision, fields, created_at, created_by, updated_at, updated_by, deleted_at, deleted_by";

/// Database handle. Owns the connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the store's own tables.
    ///
    /// sqlx serializes concurrent callers with an advisory lock, so every
    /// process may call this at startup.
    pub async fn bootstrap(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn split_delete_state(state: &DeleteState) -> (Option<DateTime<Utc>>, Option<String>) {
    match state {
        DeleteState::Active => (None, None),
        DeleteState::Deleted { at, by } => (Some(*at), Some(by.as_str().to_string())),
    }
}

/// `a.b` as a `#>` path.
fn path_segments(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn insert(&self, collection: &str, doc: &Document) -> Result<bool> {
        let (deleted_at, deleted_by) = split_delete_state(&doc.delete_state);
        let rows_affected = sqlx::query(
            "INSERT INTO store_documents (collection, id, revision, fields, created_at, created_by, updated_at, updated_by, deleted_at, deleted_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (collection, id) DO NOTHING",
        )
        .bind(collection)
        .bind(doc.id.as_str())
        .bind(doc.revision as i64)
        .bind(Value::Object(doc.fields.clone()))
        .bind(doc.audit.created_at)
        .bind(doc.audit.created_by.as_str())
        .bind(doc.audit.updated_at)
        .bind(doc.audit.updated_by.as_str())
        .bind(deleted_at)
        .bind(deleted_by)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn find(
        &self,
        collection: &str,
        query: &Query,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
        qb.push(COLUMNS);
        qb.push(" FROM store_documents WHERE collection = ");
        qb.push_bind(collection.to_string());

        if let Some(id) = query.id() {
            qb.push(" AND id = ");
            qb.push_bind(id.as_str().to_string());
        }
        // Whole-value equality, not containment.
        for (path, value) in query.conditions() {
            qb.push(" AND fields #> ");
            qb.push_bind(path_segments(path));
            qb.push(" = ");
            qb.push_bind(value.clone());
        }
        match query.deletion() {
            DeletionFilter::Any => {}
            DeletionFilter::ActiveOnly => {
                qb.push(" AND deleted_at IS NULL");
            }
            DeletionFilter::DeletedOnly => {
                qb.push(" AND deleted_at IS NOT NULL");
            }
        }

        match options.sort {
            Some((ref path, order)) => {
                qb.push(" ORDER BY fields #> ");
                qb.push_bind(path_segments(path));
                qb.push(match order {
                    SortOrder::Ascending => " ASC",
                    SortOrder::Descending => " DESC",
                });
                qb.push(", id ASC");
            }
            None => {
                qb.push(" ORDER BY id ASC");
            }
        }
        if let Some(limit) = options.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }
        if options.skip > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(options.skip as i64);
        }

        let rows: Vec<DocumentRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(DocumentRow::try_into_document).collect()
    }

    async fn replace(
        &self,
        collection: &str,
        doc: &Document,
        expected_revision: u64,
    ) -> Result<bool> {
        let (deleted_at, deleted_by) = split_delete_state(&doc.delete_state);
        let rows_affected = sqlx::query(
            "UPDATE store_documents
             SET revision = $3, fields = $4, created_at = $5, created_by = $6,
                 updated_at = $7, updated_by = $8, deleted_at = $9, deleted_by = $10
             WHERE collection = $1 AND id = $2 AND revision = $11",
        )
        .bind(collection)
        .bind(doc.id.as_str())
        .bind(doc.revision as i64)
        .bind(Value::Object(doc.fields.clone()))
        .bind(doc.audit.created_at)
        .bind(doc.audit.created_by.as_str())
        .bind(doc.audit.updated_at)
        .bind(doc.audit.updated_by.as_str())
        .bind(deleted_at)
        .bind(deleted_by)
        .bind(expected_revision as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn remove(
        &self,
        collection: &str,
        id: &DocumentId,
        expected_revision: Option<u64>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "DELETE FROM store_documents
             WHERE collection = $1 AND id = $2 AND ($3::bigint IS NULL OR revision = $3)",
        )
        .bind(collection)
        .bind(id.as_str())
        .bind(expected_revision.map(|r| r as i64))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    /// Simple health check: run a SELECT 1.
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    revision: i64,
    fields: Value,
    created_at: DateTime<Utc>,
    created_by: String,
    updated_at: DateTime<Utc>,
    updated_by: String,
    deleted_at: Option<DateTime<Utc>>,
    deleted_by: Option<String>,
}

impl DocumentRow {
    fn try_into_document(self) -> Result<Document> {
        let Value::Object(fields) = self.fields else {
            return Err(Error::Other(format!("document {} has non-object fields", self.id)));
        };
        let delete_state = match (self.deleted_at, self.deleted_by) {
            (Some(at), Some(by)) => DeleteState::Deleted {
                at,
                by: Actor::new(by),
            },
            _ => DeleteState::Active,
        };
        Ok(Document {
            id: DocumentId(self.id),
            revision: self.revision as u64,
            fields,
            audit: Audit {
                created_at: self.created_at,
                created_by: Actor::new(self.created_by),
                updated_at: self.updated_at,
                updated_by: Actor::new(self.updated_by),
            },
            delete_state,
        })
    }
}
