//! In-process store.
//!
//! Several lock managers or migration runners sharing one
//! `Arc<MemoryStore>` behave like several processes sharing one database:
//! they coordinate only through the atomic operations below.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::Store;
use crate::error::Result;
use crate::model::{Document, DocumentId, FindOptions, Query, SortOrder, compare_values};

type Collection = BTreeMap<DocumentId, Document>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection, deleted ones included.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, collection: &str, doc: &Document) -> Result<bool> {
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(&doc.id) {
            return Ok(false);
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(true)
    }

    async fn find(
        &self,
        collection: &str,
        query: &Query,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let collections = self.collections.lock().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<Document> = match query.id() {
            Some(id) => docs.get(id).into_iter().filter(|d| query.matches(d)).cloned().collect(),
            None => docs.values().filter(|d| query.matches(d)).cloned().collect(),
        };
        drop(collections);

        if let Some((ref path, order)) = options.sort {
            // Stable sort keeps id order among equal keys.
            matched.sort_by(|a, b| {
                let ord = compare_values(a.get(path), b.get(path));
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }

        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(options.skip).take(limit).collect())
    }

    async fn replace(
        &self,
        collection: &str,
        doc: &Document,
        expected_revision: u64,
    ) -> Result<bool> {
        let mut collections = self.collections.lock().await;
        let Some(stored) = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(&doc.id))
        else {
            return Ok(false);
        };
        if stored.revision != expected_revision {
            return Ok(false);
        }
        *stored = doc.clone();
        Ok(true)
    }

    async fn remove(
        &self,
        collection: &str,
        id: &DocumentId,
        expected_revision: Option<u64>,
    ) -> Result<bool> {
        let mut collections = self.collections.lock().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let Some(current) = docs.get(id).map(|d| d.revision) else {
            return Ok(false);
        };
        if expected_revision.is_some_and(|expected| expected != current) {
            return Ok(false);
        }
        Ok(docs.remove(id).is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
