//! Host monitoring engine for a fleet management platform.
//!
//! Collection drivers push monitoring samples to the daemon over a secured
//! UDP protocol. Incoming messages are decoded by a bounded worker pool,
//! routed to the monitor manager, and the resulting records are kept in an
//! expiration-aware cache backed by durable storage.
//!
//! ```text
//! timer (manager) → MONITOR_HOST over transport → driver
//! driver reply → listener → dispatcher workers → manager → host pool → store
//! ```

pub mod actors;
pub mod config;
pub mod drivers;
pub mod host;
pub mod pool;
pub mod protocol;
pub mod record;
pub mod storage;
pub mod transport;

mod xml;

pub use host::{HostRecord, HostState};
pub use record::MonitoringRecord;
