//! Logical deletion over a soft-deletable collection.
//!
//! Default reads only see active documents; the `*_allowing_deleted` reads
//! see both states. Nothing is ever physically removed through this layer.

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::collection::{Change, Collection, Cursor, Modified};
use crate::error::{Error, Result};
use crate::model::{Actor, DeleteState, DeletionFilter, Document, DocumentId, Patch, Query};

/// Outcome of [`SoftDeleteCollection::destroy`].
#[derive(Debug)]
pub enum Destroyed {
    /// The document was active and is now deleted.
    Deleted(Box<Document>),
    /// The document was already deleted; nothing changed.
    AlreadyDeleted(Box<Document>),
}

impl Destroyed {
    pub fn document(&self) -> &Document {
        match self {
            Destroyed::Deleted(doc) | Destroyed::AlreadyDeleted(doc) => doc,
        }
    }
}

#[derive(Clone)]
pub struct SoftDeleteCollection {
    inner: Collection,
}

impl SoftDeleteCollection {
    /// Wrap `inner`, whose schema must be soft-deletable.
    pub fn new(inner: Collection) -> Result<Self> {
        if !inner.schema().is_soft_deletable() {
            return Err(Error::Schema(format!(
                "collection {} is not soft-deletable",
                inner.name()
            )));
        }
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The wrapped collection. Its reads apply no delete filtering.
    pub fn inner(&self) -> &Collection {
        &self.inner
    }

    pub async fn insert<T: Serialize + ?Sized>(&self, fields: &T, actor: &Actor) -> Result<DocumentId> {
        self.inner.insert(fields, actor).await
    }

    /// Update an active document. Deleted documents read as not found.
    pub async fn update(&self, id: &DocumentId, patch: &Patch, actor: &Actor) -> Result<Document> {
        let query = Query::by_id(id.clone()).with_deletion(DeletionFilter::ActiveOnly);
        self.inner.update_matching(query, patch, actor).await
    }

    /// `Active -> Deleted{now, actor}`. Idempotent.
    pub async fn destroy(&self, id: &DocumentId, actor: &Actor) -> Result<Destroyed> {
        let modified = self
            .inner
            .modify(Query::by_id(id.clone()), actor, |doc| {
                if doc.is_deleted() {
                    return Ok(Change::Keep);
                }
                doc.delete_state = DeleteState::Deleted {
                    at: Utc::now(),
                    by: actor.clone(),
                };
                Ok(Change::Write)
            })
            .await?;

        Ok(match modified {
            Modified::Written(doc) => {
                info!(collection = %self.name(), %id, %actor, "document destroyed");
                Destroyed::Deleted(Box::new(doc))
            }
            Modified::Unchanged(doc) => Destroyed::AlreadyDeleted(Box::new(doc)),
        })
    }

    /// `Deleted -> Active`. Fails with `NotDeleted` on an active document.
    pub async fn undestroy(&self, id: &DocumentId, actor: &Actor) -> Result<Document> {
        let modified = self
            .inner
            .modify(Query::by_id(id.clone()), actor, |doc| {
                if !doc.is_deleted() {
                    return Err(Error::NotDeleted(format!("{}/{}", self.name(), doc.id)));
                }
                doc.delete_state = DeleteState::Active;
                Ok(Change::Write)
            })
            .await?;

        match modified {
            Modified::Written(doc) => {
                info!(collection = %self.name(), %id, %actor, "document restored");
                Ok(doc)
            }
            Modified::Unchanged(doc) => Ok(doc),
        }
    }

    /// Active documents matching `query`.
    pub fn find(&self, query: Query) -> Cursor {
        self.inner
            .find(query.with_deletion(DeletionFilter::ActiveOnly))
    }

    pub async fn find_one(&self, query: impl Into<Query>) -> Result<Option<Document>> {
        let query: Query = query.into();
        self.inner
            .find_one(query.with_deletion(DeletionFilter::ActiveOnly))
            .await
    }

    /// Documents matching `query` in either delete state.
    pub fn find_allowing_deleted(&self, query: Query) -> Cursor {
        self.inner.find(query.with_deletion(DeletionFilter::Any))
    }

    pub async fn find_one_allowing_deleted(
        &self,
        query: impl Into<Query>,
    ) -> Result<Option<Document>> {
        let query: Query = query.into();
        self.inner
            .find_one(query.with_deletion(DeletionFilter::Any))
            .await
    }

    /// Only deleted documents, e.g. for a recovery view.
    pub fn find_deleted(&self, query: Query) -> Cursor {
        self.inner
            .find(query.with_deletion(DeletionFilter::DeletedOnly))
    }
}
