//! Expiration-aware host monitoring cache.
//!
//! The pool is the only shared mutable structure in the daemon. Reads go
//! through the cache and fall back to the durable store (lazy warm-up, O(1)
//! startup); writes sticky-merge into the cached record and then write
//! through to the store before returning. Each host has its own entry lock,
//! so updates for different hosts never block each other.
//!
//! Staleness is derived from `last_monitor_time` when a record is read. It is
//! never an eviction trigger; entries leave the pool only through explicit
//! removal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::host::{HostRecord, HostState, MonitorEvent};
use crate::record::MonitoringRecord;
use crate::storage::{HostRow, StorageBackend, StorageError};

/// Errors surfaced by pool operations.
#[derive(Debug)]
pub enum PoolError {
    /// The host is neither cached, stored, nor registered.
    HostUnknown(i64),

    /// The write-through (or read-through) against the store failed.
    Storage(StorageError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::HostUnknown(id) => write!(f, "unknown host: {}", id),
            PoolError::Storage(err) => write!(f, "storage error: {}", err),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Storage(err) => Some(err),
            PoolError::HostUnknown(_) => None,
        }
    }
}

impl From<StorageError> for PoolError {
    fn from(err: StorageError) -> Self {
        PoolError::Storage(err)
    }
}

/// Hosts a timer tick needs to act on.
#[derive(Debug, Default, PartialEq)]
pub struct DueHosts {
    /// Hosts whose monitoring interval has elapsed; issue a new cycle.
    pub due: Vec<i64>,

    /// Hosts stuck in MONITORING past the timeout; mark as ERROR.
    pub timed_out: Vec<i64>,
}

/// Read-through, write-through cache of [`HostRecord`]s.
pub struct HostPool {
    store: Arc<dyn StorageBackend>,

    /// Registered host identities, used to materialize entries the store has
    /// never seen. Insert-only under normal operation.
    seeds: RwLock<HashMap<i64, HostRecord>>,

    /// Materialized entries, one lock per host.
    live: RwLock<HashMap<i64, Arc<Mutex<HostRecord>>>>,

    /// Deadline for a single write-through.
    write_timeout: Duration,

    /// Age after which a record is reported stale.
    expiration: chrono::Duration,
}

impl HostPool {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        write_timeout: Duration,
        expiration: chrono::Duration,
    ) -> Self {
        Self {
            store,
            seeds: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
            write_timeout,
            expiration,
        }
    }

    pub fn expiration(&self) -> chrono::Duration {
        self.expiration
    }

    /// Register a host identity. No I/O; the entry materializes on first use.
    pub async fn register(&self, seed: HostRecord) {
        debug!(host_id = seed.id, name = %seed.name, "registering host");
        self.seeds.write().await.insert(seed.id, seed);
    }

    /// Drop a host from the pool and its registration. The durable row is
    /// left behind; removal from the store is an external operation.
    pub async fn remove(&self, host_id: i64) {
        self.live.write().await.remove(&host_id);
        self.seeds.write().await.remove(&host_id);
    }

    /// All host ids the pool knows about, registered or materialized.
    pub async fn known_ids(&self) -> Vec<i64> {
        let mut ids: HashSet<i64> = self.seeds.read().await.keys().copied().collect();
        ids.extend(self.live.read().await.keys());
        let mut ids: Vec<i64> = ids.into_iter().collect();
        ids.sort_unstable();
        ids
    }

    /// The entry for `host_id`: cached, loaded from the store, or freshly
    /// materialized from its registration, in that order.
    async fn entry(&self, host_id: i64) -> Result<Arc<Mutex<HostRecord>>, PoolError> {
        if let Some(entry) = self.live.read().await.get(&host_id) {
            return Ok(entry.clone());
        }

        // Resolve outside the map lock; racing callers may both load, the
        // second insert below wins the no-op way.
        let record = match self.store.load(host_id).await? {
            Some(row) => row.to_record()?,
            None => self
                .seeds
                .read()
                .await
                .get(&host_id)
                .cloned()
                .ok_or(PoolError::HostUnknown(host_id))?,
        };

        let mut live = self.live.write().await;
        let entry = live
            .entry(host_id)
            .or_insert_with(|| Arc::new(Mutex::new(record)));
        Ok(entry.clone())
    }

    /// Snapshot of one host record.
    pub async fn get(&self, host_id: i64) -> Result<HostRecord, PoolError> {
        let entry = self.entry(host_id).await?;
        let record = entry.lock().await.clone();
        Ok(record)
    }

    /// Whether the record for `host_id` is older than the expiration window.
    pub async fn is_stale(&self, host_id: i64, now: DateTime<Utc>) -> Result<bool, PoolError> {
        let entry = self.entry(host_id).await?;
        let stale = entry.lock().await.is_stale(self.expiration, now);
        Ok(stale)
    }

    /// Snapshots of every known host, sorted by id.
    pub async fn list_hosts(&self) -> Result<Vec<HostRecord>, PoolError> {
        let mut hosts = Vec::new();
        for id in self.known_ids().await {
            match self.get(id).await {
                Ok(record) => hosts.push(record),
                Err(PoolError::HostUnknown(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(hosts)
    }

    /// Sticky-merge a sample into the host record, drive the state machine
    /// with `event`, and write the result through to the store.
    ///
    /// The cached record keeps the merged sample even when the write-through
    /// fails; the caller decides what the storage failure means for the host.
    pub async fn update_monitoring(
        &self,
        sample: MonitoringRecord,
        event: MonitorEvent,
    ) -> Result<Option<HostState>, PoolError> {
        let entry = self.entry(sample.host_id).await?;
        let mut record = entry.lock().await;

        record.absorb(sample);
        let new_state = record.apply(event);

        self.write_through(&record).await?;
        Ok(new_state)
    }

    /// Apply a bare state-machine event (no sample) and persist the result.
    pub async fn apply_event(
        &self,
        host_id: i64,
        event: MonitorEvent,
    ) -> Result<Option<HostState>, PoolError> {
        let entry = self.entry(host_id).await?;
        let mut record = entry.lock().await;

        let new_state = record.apply(event);
        if new_state.is_none() {
            warn!(host_id, state = %record.state, ?event, "rejected state transition");
            return Ok(None);
        }

        self.write_through(&record).await?;
        Ok(new_state)
    }

    /// Force a state (operator action, e.g. OFFLINE), bypassing the table.
    pub async fn set_host_state(
        &self,
        host_id: i64,
        state: HostState,
    ) -> Result<(), PoolError> {
        let entry = self.entry(host_id).await?;
        let mut record = entry.lock().await;

        record.set_state(state);
        self.write_through(&record).await
    }

    /// Classify hosts for a timer tick. Each entry lock is held only long
    /// enough to read state and age; no I/O happens under it.
    pub async fn collect_due(
        &self,
        now: DateTime<Utc>,
        monitoring_interval: chrono::Duration,
        timeout: chrono::Duration,
    ) -> Result<DueHosts, PoolError> {
        let mut result = DueHosts::default();

        for id in self.known_ids().await {
            let entry = match self.entry(id).await {
                Ok(entry) => entry,
                Err(PoolError::HostUnknown(_)) => continue,
                Err(err) => return Err(err),
            };
            let record = entry.lock().await;
            let age = now - record.last_monitor_time;

            match record.state {
                HostState::Init => result.due.push(id),
                HostState::Monitored | HostState::Error if age >= monitoring_interval => {
                    result.due.push(id)
                }
                HostState::Monitoring if age >= monitoring_interval + timeout => {
                    result.timed_out.push(id)
                }
                _ => {}
            }
        }

        Ok(result)
    }

    async fn write_through(&self, record: &HostRecord) -> Result<(), PoolError> {
        let row = HostRow::from_record(record);
        match tokio::time::timeout(self.write_timeout, self.store.upsert(row)).await {
            Ok(result) => result.map_err(PoolError::from),
            Err(_) => Err(PoolError::Storage(StorageError::Timeout)),
        }
    }
}
