//! Core data model.
//!
//! A document belongs to exactly one collection. Besides its
//! collection-specific fields it carries system-stamped audit fields, a
//! revision used for compare-and-set, and a delete state.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::schema::FieldError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Globally unique document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Who performed a write. Recorded in `createdBy` / `updatedBy`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    /// Actor id used for writes made by the process itself
    /// (migrations, provisioning, lock bookkeeping).
    pub const SYSTEM: &'static str = "system";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Audit + delete state
// ---------------------------------------------------------------------------

/// Common fields stamped on every stored document. Never client-supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub created_at: DateTime<Utc>,
    pub created_by: Actor,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Actor,
}

impl Audit {
    pub fn stamp(actor: &Actor, now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            created_by: actor.clone(),
            updated_at: now,
            updated_by: actor.clone(),
        }
    }

    pub fn touch(&mut self, actor: &Actor, now: DateTime<Utc>) {
        self.updated_at = now;
        self.updated_by = actor.clone();
    }
}

/// Logical delete state. A single tag, so a "deleted" flag can never
/// disagree with its timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeleteState {
    #[default]
    Active,
    Deleted { at: DateTime<Utc>, by: Actor },
}

impl DeleteState {
    pub fn is_deleted(&self) -> bool {
        matches!(self, DeleteState::Deleted { .. })
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,

    /// Incremented on every write. Compare-and-set is keyed on it.
    pub revision: u64,

    /// Collection-specific fields, as validated by the collection schema.
    pub fields: Map<String, Value>,

    pub audit: Audit,

    pub delete_state: DeleteState,
}

impl Document {
    /// Build a fresh, active document at revision 1.
    pub fn new(id: DocumentId, fields: Map<String, Value>, actor: &Actor) -> Self {
        Self {
            id,
            revision: 1,
            fields,
            audit: Audit::stamp(actor, Utc::now()),
            delete_state: DeleteState::Active,
        }
    }

    /// Look up a field by dotted path (`"value.folder"`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.fields, path)
    }

    /// String field by dotted path, if present and a string.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Deserialize the collection-specific fields into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    pub fn is_deleted(&self) -> bool {
        self.delete_state.is_deleted()
    }
}

// ---------------------------------------------------------------------------
// Field paths
// ---------------------------------------------------------------------------

pub fn lookup_path<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = fields.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => current.as_object()?.get(segment)?,
        };
    }
    Some(current)
}

fn split_path(path: &str) -> std::result::Result<Vec<&str>, FieldError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(FieldError::new(path, "is not a valid field path"));
    }
    Ok(segments)
}

fn set_path(
    fields: &mut Map<String, Value>,
    path: &str,
    value: Value,
) -> std::result::Result<(), FieldError> {
    let segments = split_path(path)?;
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| FieldError::new(path, "is not a valid field path"))?;
    let mut current = fields;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| FieldError::new(path, format!("{segment} is not an object")))?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn unset_path(fields: &mut Map<String, Value>, path: &str) -> std::result::Result<(), FieldError> {
    let segments = split_path(path)?;
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| FieldError::new(path, "is not a valid field path"))?;
    let mut current = fields;
    for segment in parents {
        match current.get_mut(*segment).and_then(Value::as_object_mut) {
            Some(next) => current = next,
            None => return Ok(()),
        }
    }
    current.remove(*last);
    Ok(())
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Which delete states a query observes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletionFilter {
    /// No implicit filtering.
    #[default]
    Any,
    ActiveOnly,
    DeletedOnly,
}

impl DeletionFilter {
    pub fn admits(self, state: &DeleteState) -> bool {
        match self {
            DeletionFilter::Any => true,
            DeletionFilter::ActiveOnly => !state.is_deleted(),
            DeletionFilter::DeletedOnly => state.is_deleted(),
        }
    }
}

/// Equality query over document fields.
///
/// Conditions compare scalar values at dotted paths; all must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    id: Option<DocumentId>,
    conditions: Vec<(String, Value)>,
    deletion: DeletionFilter,
}

impl Query {
    /// Matches every document in the collection.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<DocumentId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((path.into(), value.into()));
        self
    }

    pub fn with_deletion(mut self, filter: DeletionFilter) -> Self {
        self.deletion = filter;
        self
    }

    pub fn id(&self) -> Option<&DocumentId> {
        self.id.as_ref()
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn deletion(&self) -> DeletionFilter {
        self.deletion
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(ref id) = self.id
            && *id != doc.id
        {
            return false;
        }
        self.deletion.admits(&doc.delete_state)
            && self
                .conditions
                .iter()
                .all(|(path, expected)| doc.get(path) == Some(expected))
    }
}

impl From<DocumentId> for Query {
    fn from(id: DocumentId) -> Self {
        Query::by_id(id)
    }
}

impl From<&DocumentId> for Query {
    fn from(id: &DocumentId) -> Self {
        Query::by_id(id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Options for `find`. Documents are returned in id order unless sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Total order over JSON values used when sorting in memory.
///
/// Mirrors Postgres jsonb ordering by type (null < string < number <
/// boolean < array < object); a missing value sorts after everything,
/// like SQL NULL under `ASC`.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::String(_) => 1,
            Value::Number(_) => 2,
            Value::Bool(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Number(x), Value::Number(y)) => {
                let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Set { path: String, value: Value },
    Unset { path: String },
}

/// A partial update: `$set` / `$unset` over dotted paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(PatchOp::Set {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.ops.push(PatchOp::Unset { path: path.into() });
        self
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply to a copy of `fields`. Fails on malformed paths.
    pub fn apply(
        &self,
        fields: &Map<String, Value>,
    ) -> std::result::Result<Map<String, Value>, FieldError> {
        let mut next = fields.clone();
        for op in &self.ops {
            match op {
                PatchOp::Set { path, value } => set_path(&mut next, path, value.clone())?,
                PatchOp::Unset { path } => unset_path(&mut next, path)?,
            }
        }
        Ok(next)
    }
}
