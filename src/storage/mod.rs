//! Durable record store for host monitoring data.
//!
//! The engine only needs a key-value-style record store: the last known
//! record per host, keyed by oid, written on every accepted sample and read
//! back to warm the cache after a restart. Everything goes through the
//! [`StorageBackend`] trait; the backend is selected once at startup.
//!
//! ## Backends
//!
//! - **SQLite** (default): embedded single-file store
//! - **PostgreSQL**: networked relational store for shared deployments
//! - **In-Memory**: no persistence, for tests

pub mod backend;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod schema;
pub mod sqlite;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use schema::HostRow;
