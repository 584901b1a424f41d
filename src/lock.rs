//! Named mutual exclusion over the shared store.
//!
//! A lock is a lease: one record per name in the `locks` collection saying
//! who holds it and until when. Claims use only the store's atomic
//! primitives (insert-if-absent for a fresh name, compare-and-set to take
//! over an expired record), so any number of processes can contend without
//! shared memory.
//!
//! Leases trade safety for liveness. A holder that crashes is superseded
//! once its TTL lapses, but so is a holder that is merely slow, and from
//! then on both run at once. TTLs must sit well above the longest expected
//! critical section; with renewal enabled, [`LockManager::with_lock`]
//! extends the lease every `ttl / 3` while its body runs, which narrows the
//! window to holders that stall for a whole TTL.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Actor, Document, DocumentId, FindOptions, Query};
use crate::store::SharedStore;
use crate::telemetry::metrics;

pub const LOCKS_COLLECTION: &str = "locks";

/// Floor on the retry pause, so a zero backoff never spins on the store.
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Opaque token identifying one successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderToken(pub Uuid);

impl HolderToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HolderToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HolderToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted lock state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub name: String,
    pub holder: HolderToken,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    fn to_fields(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(fields) => Ok(fields),
            _ => Err(Error::Other("lock record did not serialize to an object".into())),
        }
    }
}

/// A held lock. Pass it back to [`LockManager::release`].
#[derive(Debug, Clone)]
pub struct Lease {
    name: String,
    holder: HolderToken,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revision: u64,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> HolderToken {
        self.holder
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Released,
    /// The record was gone or had been reclaimed by another holder.
    NotHeld,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Default maximum time `acquire` waits for a live holder.
    pub max_wait: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Renew the lease while a `with_lock` body runs.
    pub renew: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
            renew: true,
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
    config: LockConfig,
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|_| Error::Other(format!("lock ttl {ttl:?} out of range")))?;
    Ok(now + ttl)
}

impl LockManager {
    pub fn new(store: SharedStore, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// One attempt to claim `name`. `None` if a live holder has it.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
        let now = Utc::now();
        let record = LockRecord {
            name: name.to_string(),
            holder: HolderToken::new(),
            acquired_at: now,
            expires_at: expiry(now, ttl)?,
        };
        let id = DocumentId::from(name);

        let revision = match self.store.find_one(LOCKS_COLLECTION, &Query::by_id(id.clone())).await? {
            None => {
                let doc = Document::new(id, record.to_fields()?, &Actor::system());
                if !self.store.insert(LOCKS_COLLECTION, &doc).await? {
                    return Ok(None);
                }
                doc.revision
            }
            Some(current) => {
                let existing: LockRecord = current.decode()?;
                if existing.is_live(now) {
                    return Ok(None);
                }
                debug!(lock = name, previous = %existing.holder, "reclaiming expired lock");
                let mut next = current.clone();
                next.fields = record.to_fields()?;
                next.revision = current.revision + 1;
                next.audit.touch(&Actor::system(), now);
                if !self
                    .store
                    .replace(LOCKS_COLLECTION, &next, current.revision)
                    .await?
                {
                    return Ok(None);
                }
                next.revision
            }
        };

        Ok(Some(Lease {
            name: record.name,
            holder: record.holder,
            acquired_at: record.acquired_at,
            expires_at: record.expires_at,
            revision,
        }))
    }

    /// Claim `name`, waiting up to the configured `max_wait`.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<Lease> {
        self.acquire_within(name, ttl, self.config.max_wait).await
    }

    /// Claim `name`, retrying with exponential backoff until `max_wait`
    /// elapses. Dropping the returned future while it waits leaves no
    /// lock state behind.
    pub async fn acquire_within(&self, name: &str, ttl: Duration, max_wait: Duration) -> Result<Lease> {
        let started = Instant::now();
        // A wait too long to represent never times out.
        let deadline = started.checked_add(max_wait);
        let mut backoff = self.config.initial_backoff.max(MIN_BACKOFF);

        loop {
            if let Some(lease) = self.try_acquire(name, ttl).await? {
                let waited = started.elapsed();
                metrics::lock_acquisitions().add(1, &[KeyValue::new("result", "acquired")]);
                metrics::lock_wait_ms().record(waited.as_secs_f64() * 1000.0, &[]);
                debug!(lock = name, holder = %lease.holder, ?waited, "lock acquired");
                return Ok(lease);
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    metrics::lock_acquisitions().add(1, &[KeyValue::new("result", "timeout")]);
                    warn!(lock = name, ?max_wait, "timed out waiting for lock");
                    return Err(Error::LockTimeout {
                        name: name.to_string(),
                        waited: now - started,
                    });
                }
                Some(deadline) => backoff.min(deadline - now),
                None => backoff,
            };
            tokio::time::sleep(pause).await;
            backoff = backoff
                .saturating_mul(2)
                .min(self.config.max_backoff)
                .max(MIN_BACKOFF);
        }
    }

    /// Push the lease's expiry to `now + ttl`. Returns `false` if the lease
    /// has been lost to another holder.
    pub async fn renew(&self, lease: &mut Lease, ttl: Duration) -> Result<bool> {
        let id = DocumentId::from(lease.name.as_str());
        let Some(current) = self.store.find_one(LOCKS_COLLECTION, &Query::by_id(id)).await? else {
            return Ok(false);
        };
        if current.revision != lease.revision {
            return Ok(false);
        }
        let mut record: LockRecord = current.decode()?;
        if record.holder != lease.holder {
            return Ok(false);
        }

        let now = Utc::now();
        record.expires_at = expiry(now, ttl)?;
        let mut next = current;
        next.fields = record.to_fields()?;
        next.revision = lease.revision + 1;
        next.audit.touch(&Actor::system(), now);
        if !self
            .store
            .replace(LOCKS_COLLECTION, &next, lease.revision)
            .await?
        {
            return Ok(false);
        }

        lease.expires_at = record.expires_at;
        lease.revision = next.revision;
        Ok(true)
    }

    /// Release a lease. A no-op (logged) when the record has moved past
    /// the lease's revision, so a reclaimed lock is never released out from
    /// under its new owner.
    pub async fn release(&self, lease: &Lease) -> Result<Released> {
        let removed = self
            .store
            .remove(
                LOCKS_COLLECTION,
                &DocumentId::from(lease.name.as_str()),
                Some(lease.revision),
            )
            .await?;
        let released = if removed {
            Released::Released
        } else {
            Released::NotHeld
        };

        match released {
            Released::Released => {
                metrics::lock_releases().add(1, &[KeyValue::new("result", "released")]);
                debug!(lock = %lease.name, holder = %lease.holder, "lock released");
            }
            Released::NotHeld => {
                metrics::lock_releases().add(1, &[KeyValue::new("result", "not_held")]);
                warn!(
                    lock = %lease.name,
                    holder = %lease.holder,
                    "lock no longer held at release; it was reclaimed after expiry"
                );
            }
        }
        Ok(released)
    }

    /// Run `body` while holding `name`, releasing on every exit path.
    pub async fn with_lock<T, F, Fut>(&self, name: &str, ttl: Duration, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_lock_within(name, ttl, self.config.max_wait, body)
            .await
    }

    /// [`with_lock`](Self::with_lock) with an explicit maximum wait.
    pub async fn with_lock_within<T, F, Fut>(
        &self,
        name: &str,
        ttl: Duration,
        max_wait: Duration,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.acquire_within(name, ttl, max_wait).await?;
        let mut held = HeldLease {
            locks: self.clone(),
            lease,
            armed: true,
        };

        let outcome = if self.config.renew {
            self.run_renewing(&mut held.lease, ttl, body()).await
        } else {
            body().await
        };

        held.release().await;
        outcome
    }

    async fn run_renewing<T>(
        &self,
        lease: &mut Lease,
        ttl: Duration,
        body: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let every = ttl / 3;
        if every.is_zero() {
            return body.await;
        }

        let mut body = std::pin::pin!(body);
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut body => return outcome,
                _ = ticker.tick() => match self.renew(lease, ttl).await {
                    Ok(true) => debug!(lock = %lease.name, expires_at = %lease.expires_at, "lease renewed"),
                    Ok(false) => warn!(lock = %lease.name, "lease lost while held; another holder may be running"),
                    Err(e) => warn!(lock = %lease.name, error = %e, "lease renewal failed"),
                },
            }
        }
    }

    /// Every lock record, live or expired.
    pub async fn list(&self) -> Result<Vec<LockRecord>> {
        self.store
            .find(LOCKS_COLLECTION, &Query::all(), &FindOptions::default())
            .await?
            .iter()
            .map(|doc| doc.decode())
            .collect()
    }

    /// Delete a lock record regardless of holder. Operator use only: the
    /// evicted holder keeps running its critical section.
    pub async fn force_release(&self, name: &str) -> Result<bool> {
        let removed = self
            .store
            .remove(LOCKS_COLLECTION, &DocumentId::from(name), None)
            .await?;
        if removed {
            info!(lock = name, "lock forcibly released");
        }
        Ok(removed)
    }
}

/// A lease held by [`LockManager::with_lock`]. If the body panics or the
/// future is dropped before the normal release, dropping this spawns the
/// release onto the current runtime.
struct HeldLease {
    locks: LockManager,
    lease: Lease,
    armed: bool,
}

impl HeldLease {
    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.locks.release(&self.lease).await {
            warn!(lock = %self.lease.name, error = %e, "failed to release lock; it will lapse at expiry");
        }
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.lease.name, "lock holder exited without a runtime; it will lapse at expiry");
            return;
        };
        warn!(lock = %self.lease.name, "lock holder exited early; releasing in the background");
        let locks = self.locks.clone();
        let lease = self.lease.clone();
        runtime.spawn(async move {
            if let Err(e) = locks.release(&lease).await {
                warn!(lock = %lease.name, error = %e, "failed to release lock; it will lapse at expiry");
            }
        });
    }
}
