//! Storage backend trait definition
//!
//! This module defines the record-store contract every backend must honor.
//! The engine writes one row per accepted sample and reads rows back lazily
//! to warm the cache; it never deletes rows itself (host removal is an
//! external operation).

use async_trait::async_trait;

use super::error::StorageResult;
use super::schema::HostRow;

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: std::collections::HashMap<String, String>,
}

/// Trait for persistent host-record stores.
///
/// Implementations must be `Send + Sync`; they are shared across async
/// tasks. Per-row upserts must not serialize unrelated hosts behind a global
/// write lock: rely on per-row transactions or row-level locking.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the last known record for one host.
    async fn load(&self, oid: i64) -> StorageResult<Option<HostRow>>;

    /// Insert or replace the record for one host.
    ///
    /// The caller treats a successful return as a durability guarantee, so
    /// implementations must commit before returning.
    async fn upsert(&self, row: HostRow) -> StorageResult<()>;

    /// All stored rows, used once at startup for diagnostics. Not on the hot
    /// path; the cache itself warms lazily.
    async fn scan(&self) -> StorageResult<Vec<HostRow>>;

    /// Lightweight operational check (ping the database, count rows).
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources.
    async fn close(&self) -> StorageResult<()>;
}
