//! In-memory storage backend implementation
//!
//! Non-durable backend for tests and `storage = none` deployments. Rows live
//! in a `HashMap` behind an async `RwLock` and vanish when the process exits.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::StorageResult;
use super::schema::HostRow;

/// Volatile host-record store.
#[derive(Default)]
pub struct MemoryBackend {
    rows: RwLock<HashMap<i64, HostRow>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        debug!("initializing in-memory backend");
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self, oid: i64) -> StorageResult<Option<HostRow>> {
        Ok(self.rows.read().await.get(&oid).cloned())
    }

    async fn upsert(&self, row: HostRow) -> StorageResult<()> {
        self.rows.write().await.insert(row.oid, row);
        Ok(())
    }

    async fn scan(&self) -> StorageResult<Vec<HostRow>> {
        let mut rows: Vec<HostRow> = self.rows.read().await.values().cloned().collect();
        rows.sort_by_key(|r| r.oid);
        Ok(rows)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let count = self.rows.read().await.len();

        Ok(HealthStatus {
            healthy: true,
            message: format!("in-memory: {count} host records"),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("records".to_string(), count.to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        self.rows.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostRecord;

    #[tokio::test]
    async fn upsert_load_scan() {
        let backend = MemoryBackend::new();

        for oid in [9, 2, 5] {
            let record = HostRecord::new(oid, format!("node{oid:02}"), "udp");
            backend.upsert(HostRow::from_record(&record)).await.unwrap();
        }

        assert_eq!(backend.load(5).await.unwrap().unwrap().name, "node05");
        assert!(backend.load(1).await.unwrap().is_none());

        let oids: Vec<i64> = backend
            .scan()
            .await
            .unwrap()
            .iter()
            .map(|r| r.oid)
            .collect();
        assert_eq!(oids, vec![2, 5, 9]);
    }

    #[tokio::test]
    async fn close_discards_rows() {
        let backend = MemoryBackend::new();
        let record = HostRecord::new(1, "node01", "udp");
        backend.upsert(HostRow::from_record(&record)).await.unwrap();

        backend.close().await.unwrap();
        assert!(backend.scan().await.unwrap().is_empty());
    }
}
