//! Idempotent get-or-create for externally owned resources.
//!
//! A [`ProvisionCache`] keeps a local record for each external resource it
//! creates. Lookups hit the record; a miss takes a per-key lock, looks
//! again (another process may have created it while we waited), and only
//! then calls the provider and writes the record. The lock is the only
//! thing preventing duplicate creation.
//!
//! Placement reconciliation (moving the resource under its desired parent)
//! runs outside the lock and must be safe to repeat.
//!
//! If the provider succeeds but a later step (initial grants or the local
//! write) fails, the resource is orphaned and a retry creates another. The
//! provider offers no transactional join with the store, so this is
//! accepted and logged.

pub mod drive;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Instrument, debug, error, info};

use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::model::{Actor, Document, DocumentId, Patch, Query};
use crate::telemetry::{metrics, spans};

/// Identifier assigned by the external provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Folder,
    Spreadsheet,
    Document,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub resource_type: ResourceType,
    pub parent: Option<ExternalId>,
    /// Existing resource to copy instead of creating a blank one.
    pub template: Option<ExternalId>,
}

/// Who a permission is granted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Grantee {
    /// Anyone holding the link.
    Anyone,
    User(String),
}

impl std::fmt::Display for Grantee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Grantee::Anyone => f.write_str("anyone"),
            Grantee::User(email) => f.write_str(email),
        }
    }
}

/// What the core needs from an external resource provider.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create(&self, request: &CreateRequest) -> Result<ExternalId>;

    async fn move_to(&self, id: &ExternalId, new_parent: &ExternalId) -> Result<()>;

    async fn rename(&self, id: &ExternalId, name: &str) -> Result<()>;

    async fn grant(&self, id: &ExternalId, grantee: &Grantee, role: &str) -> Result<()>;
}

/// How one kind of resource maps onto its local record.
pub trait ResourceKind: Send + Sync {
    /// Caller-supplied description of the resource wanted.
    type Request: Send + Sync;

    /// Short label for logs and metrics.
    fn kind(&self) -> &'static str;

    /// Lock serializing creation for one logical key.
    fn lock_name(&self, request: &Self::Request) -> String;

    /// Query finding the existing record, if any.
    fn lookup(&self, request: &Self::Request) -> Query;

    fn create_request(&self, request: &Self::Request) -> CreateRequest;

    /// Fixed record id, for records keyed by another entity's id.
    fn record_id(&self, _request: &Self::Request) -> Option<DocumentId> {
        None
    }

    /// Permissions applied to a freshly created resource before its record
    /// is written.
    fn initial_grants(&self, _request: &Self::Request) -> Vec<(Grantee, &'static str)> {
        Vec::new()
    }

    /// Fields of the record for a freshly created resource.
    fn record(&self, request: &Self::Request, created: &ExternalId) -> Value;

    /// External id stored in a record.
    fn resource_id(&self, record: &Document) -> Result<ExternalId>;

    fn desired_placement(&self, _request: &Self::Request) -> Option<ExternalId> {
        None
    }

    fn placement(&self, _record: &Document) -> Option<ExternalId> {
        None
    }

    fn placement_patch(&self, _placement: &ExternalId) -> Patch {
        Patch::new()
    }
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub record: Document,
    pub resource: ExternalId,
    /// This call created the external resource.
    pub created: bool,
    /// This call moved the resource to its desired placement.
    pub reconciled: bool,
}

pub struct ProvisionCache<K: ResourceKind> {
    records: Collection,
    locks: LockManager,
    provider: Arc<dyn ResourceProvider>,
    kind: K,
    lock_ttl: Duration,
}

impl<K: ResourceKind> ProvisionCache<K> {
    pub fn new(
        records: Collection,
        locks: LockManager,
        provider: Arc<dyn ResourceProvider>,
        kind: K,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            records,
            locks,
            provider,
            kind,
            lock_ttl,
        }
    }

    pub fn records(&self) -> &Collection {
        &self.records
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub async fn lookup(&self, request: &K::Request) -> Result<Option<Document>> {
        self.records.find_one(self.kind.lookup(request)).await
    }

    /// Return the record for `request`, creating the external resource
    /// first if no record exists, then reconcile its placement.
    pub async fn ensure(&self, request: &K::Request) -> Result<Provisioned> {
        let lock_name = self.kind.lock_name(request);
        let span = spans::provision_span(self.kind.kind(), &lock_name);

        async {
            let (record, created) = match self.lookup(request).await? {
                Some(record) => {
                    self.record_outcome("cached");
                    (record, false)
                }
                None => {
                    self.locks
                        .with_lock(&lock_name, self.lock_ttl, || self.create_locked(request))
                        .await?
                }
            };
            self.reconcile(request, record, created).await
        }
        .instrument(span)
        .await
    }

    /// Runs under the per-key lock.
    async fn create_locked(&self, request: &K::Request) -> Result<(Document, bool)> {
        if let Some(record) = self.lookup(request).await? {
            debug!(kind = self.kind.kind(), "created by another holder while waiting");
            self.record_outcome("cached");
            return Ok((record, false));
        }

        info!(kind = self.kind.kind(), "creating missing external resource");
        let resource = self
            .provider
            .create(&self.kind.create_request(request))
            .await?;

        let id = self.persist(request, &resource).await.inspect_err(|e| {
            error!(
                kind = self.kind.kind(),
                %resource,
                error = %e,
                "external resource created but its record was not saved; it is orphaned"
            );
        })?;

        let record = self
            .records
            .find_one(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{}/{id}", self.records.name())))?;
        self.record_outcome("created");
        Ok((record, true))
    }

    /// Apply initial grants, then write the record for a new resource.
    async fn persist(&self, request: &K::Request, resource: &ExternalId) -> Result<DocumentId> {
        for (grantee, role) in self.kind.initial_grants(request) {
            self.provider.grant(resource, &grantee, role).await?;
        }

        let fields = self.kind.record(request, resource);
        match self.kind.record_id(request) {
            Some(id) => {
                self.records
                    .insert_with_id(id, &fields, &Actor::system())
                    .await
            }
            None => self.records.insert(&fields, &Actor::system()).await,
        }
    }

    async fn reconcile(
        &self,
        request: &K::Request,
        record: Document,
        created: bool,
    ) -> Result<Provisioned> {
        let resource = self.kind.resource_id(&record)?;
        let desired = match self.kind.desired_placement(request) {
            Some(desired) if self.kind.placement(&record).as_ref() != Some(&desired) => desired,
            _ => {
                return Ok(Provisioned {
                    record,
                    resource,
                    created,
                    reconciled: false,
                });
            }
        };

        info!(kind = self.kind.kind(), %resource, parent = %desired, "moving resource to desired placement");
        self.provider.move_to(&resource, &desired).await?;
        let record = self
            .records
            .update(&record.id, &self.kind.placement_patch(&desired), &Actor::system())
            .await?;
        self.record_outcome("reconciled");

        Ok(Provisioned {
            record,
            resource,
            created,
            reconciled: true,
        })
    }

    fn record_outcome(&self, result: &'static str) {
        metrics::provision_operations().add(
            1,
            &[
                KeyValue::new("kind", self.kind.kind()),
                KeyValue::new("result", result),
            ],
        );
    }
}
