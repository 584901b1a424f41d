//! Metric instrument factories.
//!
//! Instruments come from the `"huntstore"` meter on the globally registered
//! `MeterProvider`. Without one installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("huntstore")
}

/// Counter: validated writes committed to a collection.
/// Labels: `collection`, `operation` ("insert" | "update" | "remove").
pub fn collection_writes() -> Counter<u64> {
    meter()
        .u64_counter("huntstore.collection.writes")
        .with_description("Number of committed collection writes")
        .build()
}

/// Counter: lock acquisition outcomes.
/// Labels: `result` ("acquired" | "timeout").
pub fn lock_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("huntstore.lock.acquisitions")
        .with_description("Number of lock acquisition attempts that finished")
        .build()
}

/// Counter: lock release outcomes.
/// Labels: `result` ("released" | "not_held").
pub fn lock_releases() -> Counter<u64> {
    meter()
        .u64_counter("huntstore.lock.releases")
        .with_description("Number of lock releases")
        .build()
}

/// Histogram: time spent waiting before a lock was acquired.
pub fn lock_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("huntstore.lock.wait_ms")
        .with_description("Time spent waiting to acquire a lock")
        .with_unit("ms")
        .build()
}

/// Counter: migrations this process applied.
pub fn migrations_applied() -> Counter<u64> {
    meter()
        .u64_counter("huntstore.migrations.applied")
        .with_description("Number of migrations applied by this process")
        .build()
}

/// Counter: provisioning outcomes.
/// Labels: `kind`, `result` ("cached" | "created" | "reconciled").
pub fn provision_operations() -> Counter<u64> {
    meter()
        .u64_counter("huntstore.provision.operations")
        .with_description("Number of provisioning outcomes")
        .build()
}
