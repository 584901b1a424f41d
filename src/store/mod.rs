//! Persistent store capability.
//!
//! Everything shared between processes goes through a [`Store`]. Besides
//! plain reads and writes it offers the two atomic primitives cross-process
//! coordination is built on: insert-if-absent and single-record
//! compare-and-set keyed on the document revision.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Document, DocumentId, FindOptions, Query};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Shared handle used by collections, locks and the migration runner.
pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert `doc` unless a document with the same id exists.
    /// Returns `false` (and writes nothing) on conflict.
    async fn insert(&self, collection: &str, doc: &Document) -> Result<bool>;

    /// All documents matching `query`, ordered and paged by `options`.
    async fn find(
        &self,
        collection: &str,
        query: &Query,
        options: &FindOptions,
    ) -> Result<Vec<Document>>;

    /// First document matching `query`, in id order.
    async fn find_one(&self, collection: &str, query: &Query) -> Result<Option<Document>> {
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        Ok(self
            .find(collection, query, &options)
            .await?
            .into_iter()
            .next())
    }

    /// Overwrite the stored document with `doc` iff its revision is still
    /// `expected_revision`. Returns whether the write happened.
    async fn replace(&self, collection: &str, doc: &Document, expected_revision: u64)
    -> Result<bool>;

    /// Physically delete a document, optionally only at a given revision.
    /// Returns whether a document was removed.
    async fn remove(
        &self,
        collection: &str,
        id: &DocumentId,
        expected_revision: Option<u64>,
    ) -> Result<bool>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;
}
