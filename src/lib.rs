//! # huntstore
//!
//! Persistence and coordination layer for collaborative puzzle hunts.
//!
//! Schema-validated document collections with audit stamping and soft
//! deletion, leased named locks over the shared store, versioned one-time
//! migrations run safely from many processes at once, and idempotent
//! provisioning of external resources such as drive folders and documents.

pub mod collection;
pub mod config;
pub mod error;
pub mod lock;
pub mod migration;
pub mod model;
pub mod models;
pub mod provision;
pub mod schema;
pub mod soft_delete;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
