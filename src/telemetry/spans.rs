//! Span helpers for migrations and provisioning.

use tracing::Span;

use crate::migration::MigrationState;

/// Span covering one migration from lock wait to marker advance.
///
/// `migration.state` starts empty and is filled in by
/// [`record_migration_state`].
pub fn migration_span(version: u32, name: &str) -> Span {
    tracing::info_span!(
        "migration.apply",
        "migration.version" = version,
        "migration.name" = name,
        "migration.state" = tracing::field::Empty,
    )
}

/// Record a state change on a migration span and emit it as an event.
pub fn record_migration_state(span: &Span, from: MigrationState, to: MigrationState) {
    span.record("migration.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(%from, %to, "migration_state");
    });
}

pub fn provision_span(kind: &str, lock_name: &str) -> Span {
    tracing::info_span!(
        "provision.ensure",
        "provision.kind" = kind,
        "provision.lock" = lock_name,
    )
}
