//! Versioned one-time data migrations.
//!
//! The highest applied version lives in a single marker document
//! (`migrations/control`). At startup every process walks the migrations
//! above the marker in version order. Each one runs under the `migrations`
//! lock with a double-checked marker read, so exactly one process executes
//! a given `up` and the rest observe the advanced marker and skip it.
//!
//! A failed `up` is fatal: the error propagates out of [`MigrationRunner::run`]
//! and the process must not start serving. There is no automatic rollback.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{Instrument, Span, error, info, warn};

use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::model::{Actor, Document, DocumentId, Query};
use crate::store::SharedStore;
use crate::telemetry::{metrics, spans};

pub const MIGRATIONS_COLLECTION: &str = "migrations";
pub const MARKER_ID: &str = "control";
pub const MIGRATION_LOCK: &str = "migrations";

/// The body of a migration.
#[async_trait]
pub trait MigrationStep: Send + Sync {
    async fn up(&self, store: SharedStore) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MigrationStep for F
where
    F: Fn(SharedStore) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn up(&self, store: SharedStore) -> Result<()> {
        (self)(store).await
    }
}

pub struct Migration {
    version: u32,
    name: String,
    step: Arc<dyn MigrationStep>,
}

impl Migration {
    pub fn new(version: u32, name: impl Into<String>, step: impl MigrationStep + 'static) -> Self {
        Self {
            version,
            name: name.into(),
            step: Arc::new(step),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered migration list, assembled once at startup.
#[derive(Debug, Default)]
pub struct Migrations {
    ordered: Vec<Migration>,
}

impl Migrations {
    /// Sort by version. Rejects version 0 and duplicate versions.
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by_key(|m| m.version);
        if let Some(first) = migrations.first()
            && first.version == 0
        {
            return Err(Error::Config(format!(
                "migration {:?} uses reserved version 0",
                first.name
            )));
        }
        if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(Error::Config(format!(
                "migrations {:?} and {:?} share version {}",
                pair[0].name, pair[1].name, pair[0].version
            )));
        }
        Ok(Self {
            ordered: migrations,
        })
    }

    /// Highest known version; 0 when empty.
    pub fn latest_version(&self) -> u32 {
        self.ordered.last().map_or(0, |m| m.version)
    }

    /// Migrations with a version strictly above `applied`, ascending.
    pub fn pending(&self, applied: u32) -> impl Iterator<Item = &Migration> {
        self.ordered.iter().filter(move |m| m.version > applied)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Lifecycle of one migration within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Running,
    Applied,
    /// Another process applied it first.
    Skipped,
    Failed,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationState::Pending => "pending",
            MigrationState::Running => "running",
            MigrationState::Applied => "applied",
            MigrationState::Skipped => "skipped",
            MigrationState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub starting_version: u32,
    pub final_version: u32,
    /// Versions this process ran.
    pub applied: Vec<u32>,
    /// Versions found already applied after taking the lock.
    pub skipped: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current_version: u32,
    pub latest_version: u32,
    pub pending: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Marker {
    version: u32,
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Lease on the migrations lock. Renewed while `up` runs if the lock
    /// manager renews leases.
    pub lock_ttl: Duration,
    /// How long to wait for another process's migration to finish.
    pub max_wait: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(600),
            max_wait: Duration::from_secs(3600),
        }
    }
}

pub struct MigrationRunner {
    store: SharedStore,
    locks: LockManager,
    migrations: Arc<Migrations>,
    config: MigrationConfig,
}

impl MigrationRunner {
    pub fn new(
        store: SharedStore,
        locks: LockManager,
        migrations: Arc<Migrations>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            store,
            locks,
            migrations,
            config,
        }
    }

    /// Highest applied version. Creates the marker at 0 if absent.
    pub async fn current_version(&self) -> Result<u32> {
        let (_, marker) = self.read_marker().await?;
        Ok(marker.version)
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        let current_version = self.current_version().await?;
        Ok(MigrationStatus {
            current_version,
            latest_version: self.migrations.latest_version(),
            pending: self
                .migrations
                .pending(current_version)
                .map(Migration::version)
                .collect(),
        })
    }

    /// Bring the store up to the latest known version.
    pub async fn run(&self) -> Result<MigrationReport> {
        let starting_version = self.current_version().await?;
        let latest = self.migrations.latest_version();
        if starting_version > latest {
            warn!(
                current = starting_version,
                latest, "store is at a newer migration version than this build knows"
            );
        }

        let mut report = MigrationReport {
            starting_version,
            final_version: starting_version,
            applied: Vec::new(),
            skipped: Vec::new(),
        };

        for migration in self.migrations.pending(starting_version) {
            let span = spans::migration_span(migration.version, &migration.name);
            let state = self
                .locks
                .with_lock_within(
                    MIGRATION_LOCK,
                    self.config.lock_ttl,
                    self.config.max_wait,
                    || self.apply(migration, span.clone()),
                )
                .instrument(span.clone())
                .await?;

            match state {
                MigrationState::Applied => report.applied.push(migration.version),
                MigrationState::Skipped => report.skipped.push(migration.version),
                _ => {}
            }
        }

        report.final_version = self.current_version().await?;
        info!(
            from = report.starting_version,
            to = report.final_version,
            applied = report.applied.len(),
            "migrations complete"
        );
        Ok(report)
    }

    /// Runs under the migrations lock.
    async fn apply(&self, migration: &Migration, span: Span) -> Result<MigrationState> {
        let (marker_doc, marker) = self.read_marker().await?;
        if marker.version >= migration.version {
            info!(
                version = migration.version,
                marker = marker.version,
                "migration already applied elsewhere, skipping"
            );
            spans::record_migration_state(&span, MigrationState::Pending, MigrationState::Skipped);
            return Ok(MigrationState::Skipped);
        }

        spans::record_migration_state(&span, MigrationState::Pending, MigrationState::Running);
        info!(version = migration.version, name = %migration.name, "running migration");

        if let Err(e) = migration.step.up(self.store.clone()).await {
            spans::record_migration_state(&span, MigrationState::Running, MigrationState::Failed);
            error!(version = migration.version, name = %migration.name, error = %e, "migration failed");
            return Err(Error::Migration {
                version: migration.version,
                name: migration.name.clone(),
                source: Box::new(e),
            });
        }

        self.advance_marker(marker_doc, marker, migration.version)
            .await?;
        metrics::migrations_applied().add(1, &[]);
        spans::record_migration_state(&span, MigrationState::Running, MigrationState::Applied);
        Ok(MigrationState::Applied)
    }

    async fn read_marker(&self) -> Result<(Document, Marker)> {
        let query = Query::by_id(MARKER_ID);
        for _ in 0..2 {
            if let Some(doc) = self.store.find_one(MIGRATIONS_COLLECTION, &query).await? {
                let marker: Marker = doc.decode()?;
                return Ok((doc, marker));
            }
            let doc = Document::new(DocumentId::from(MARKER_ID), marker_fields(0), &Actor::system());
            if self.store.insert(MIGRATIONS_COLLECTION, &doc).await? {
                return Ok((doc, Marker { version: 0 }));
            }
            // Lost the race to create it; read the winner's.
        }
        Err(Error::Other("migration marker vanished while being created".into()))
    }

    /// Compare-and-set the marker from `marker.version` to `to`.
    async fn advance_marker(&self, current: Document, marker: Marker, to: u32) -> Result<()> {
        if to <= marker.version {
            return Err(Error::MarkerConflict {
                expected: marker.version,
                found: to,
            });
        }

        let mut next = current.clone();
        next.fields = marker_fields(to);
        next.revision = current.revision + 1;
        next.audit.touch(&Actor::system(), Utc::now());

        if self
            .store
            .replace(MIGRATIONS_COLLECTION, &next, current.revision)
            .await?
        {
            return Ok(());
        }

        let (_, found) = self.read_marker().await?;
        Err(Error::MarkerConflict {
            expected: marker.version,
            found: found.version,
        })
    }
}

fn marker_fields(version: u32) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("version".to_string(), json!(version));
    fields
}
