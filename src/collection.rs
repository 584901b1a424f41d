//! Schema-enforced access to one named collection.
//!
//! Every write is validated before it touches the store and stamps the
//! audit fields. Updates are read-modify-write cycles committed with
//! compare-and-set, retried when another writer got there first.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Actor, Document, DocumentId, FindOptions, Patch, Query, SortOrder};
use crate::schema::Schema;
use crate::store::SharedStore;
use crate::telemetry::metrics;

/// Upper bound on compare-and-set retries for one logical write.
const MAX_WRITE_ATTEMPTS: usize = 16;

/// What a modification closure decided.
pub(crate) enum Change {
    Write,
    Keep,
}

/// Result of [`Collection::modify`].
pub(crate) enum Modified {
    Written(Document),
    Unchanged(Document),
}

#[derive(Clone)]
pub struct Collection {
    store: SharedStore,
    name: String,
    schema: Arc<Schema>,
}

impl Collection {
    pub fn new(store: SharedStore, name: impl Into<String>, schema: Schema) -> Self {
        Self {
            store,
            name: name.into(),
            schema: Arc::new(schema),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Validate, stamp and persist a new document. Returns its id.
    pub async fn insert<T: Serialize + ?Sized>(&self, fields: &T, actor: &Actor) -> Result<DocumentId> {
        self.insert_with_id(DocumentId::new(), fields, actor).await
    }

    /// Like [`insert`](Self::insert) with a caller-chosen id, for collections
    /// keyed by another entity's identifier.
    pub async fn insert_with_id<T: Serialize + ?Sized>(
        &self,
        id: DocumentId,
        fields: &T,
        actor: &Actor,
    ) -> Result<DocumentId> {
        let value = serde_json::to_value(fields)?;
        let fields = self.schema.validate(&value)?;
        let doc = Document::new(id, fields, actor);

        if !self.store.insert(&self.name, &doc).await? {
            return Err(Error::DuplicateId(format!("{}/{}", self.name, doc.id)));
        }

        self.record_write("insert");
        debug!(collection = %self.name, id = %doc.id, "document inserted");
        Ok(doc.id)
    }

    /// Lazy cursor over matching documents. Nothing is read until the
    /// cursor is fetched, and it may be fetched any number of times.
    pub fn find(&self, query: Query) -> Cursor {
        Cursor {
            store: Arc::clone(&self.store),
            collection: self.name.clone(),
            query,
            options: FindOptions::default(),
        }
    }

    /// The matching document, or `None`.
    pub async fn find_one(&self, query: impl Into<Query>) -> Result<Option<Document>> {
        self.store.find_one(&self.name, &query.into()).await
    }

    /// Apply `patch`, validate the result against the full schema, re-stamp
    /// `updatedAt`/`updatedBy`, and commit atomically.
    pub async fn update(&self, id: &DocumentId, patch: &Patch, actor: &Actor) -> Result<Document> {
        self.update_matching(Query::by_id(id.clone()), patch, actor)
            .await
    }

    pub(crate) async fn update_matching(
        &self,
        query: Query,
        patch: &Patch,
        actor: &Actor,
    ) -> Result<Document> {
        let modified = self
            .modify(query, actor, |doc| {
                let merged = patch.apply(&doc.fields)?;
                doc.fields = self.schema.validate(&Value::Object(merged))?;
                Ok(Change::Write)
            })
            .await?;
        self.record_write("update");
        match modified {
            Modified::Written(doc) | Modified::Unchanged(doc) => Ok(doc),
        }
    }

    /// Physical deletion. Refused for soft-deletable collections.
    pub async fn remove(&self, id: &DocumentId) -> Result<()> {
        if self.schema.is_soft_deletable() {
            return Err(Error::SoftDeleteOnly(self.name.clone()));
        }
        if !self.store.remove(&self.name, id, None).await? {
            return Err(Error::NotFound(format!("{}/{id}", self.name)));
        }
        self.record_write("remove");
        debug!(collection = %self.name, %id, "document removed");
        Ok(())
    }

    /// Read-modify-write loop over the first document matching `query`.
    ///
    /// `f` mutates a copy; on `Change::Write` the copy is committed with
    /// compare-and-set against the revision that was read.
    pub(crate) async fn modify<F>(&self, query: Query, actor: &Actor, mut f: F) -> Result<Modified>
    where
        F: FnMut(&mut Document) -> Result<Change>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let Some(current) = self.store.find_one(&self.name, &query).await? else {
                return Err(Error::NotFound(describe(&self.name, &query)));
            };

            let mut next = current.clone();
            if let Change::Keep = f(&mut next)? {
                return Ok(Modified::Unchanged(current));
            }
            next.revision = current.revision + 1;
            next.audit.touch(actor, Utc::now());

            if self.store.replace(&self.name, &next, current.revision).await? {
                return Ok(Modified::Written(next));
            }
            debug!(collection = %self.name, id = %current.id, attempt, "concurrent write, retrying");
        }
        Err(Error::Contention(describe(&self.name, &query)))
    }

    fn record_write(&self, operation: &'static str) {
        metrics::collection_writes().add(
            1,
            &[
                KeyValue::new("collection", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

fn describe(collection: &str, query: &Query) -> String {
    match query.id() {
        Some(id) => format!("{collection}/{id}"),
        None => format!("{collection} matching {:?}", query.conditions()),
    }
}

/// A restartable, finite sequence of documents.
#[derive(Clone)]
pub struct Cursor {
    store: SharedStore,
    collection: String,
    query: Query,
    options: FindOptions,
}

impl Cursor {
    pub fn sort(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.options.sort = Some((path.into(), order));
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.options.skip = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.options.limit = Some(n);
        self
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub async fn fetch(&self) -> Result<Vec<Document>> {
        self.store
            .find(&self.collection, &self.query, &self.options)
            .await
    }

    /// Fetch and decode every document's fields into `T`.
    pub async fn fetch_as<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.fetch().await?.iter().map(|doc| doc.decode()).collect()
    }

    pub async fn first(&self) -> Result<Option<Document>> {
        let options = FindOptions {
            limit: Some(1),
            ..self.options.clone()
        };
        Ok(self
            .store
            .find(&self.collection, &self.query, &options)
            .await?
            .into_iter()
            .next())
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.fetch().await?.len())
    }
}
