//! Persisted row shape for host records.
//!
//! The store keeps one row per host: the oid, the display name (for
//! operator-facing diagnostics without parsing the blob), the full record as
//! XML, and the last monitor time for bulk scans. The XML blob is the
//! authoritative serialization; external readers parse it by tag name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::HostRecord;

use super::error::StorageError;

/// One durable host record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRow {
    /// Host oid, the primary key.
    pub oid: i64,

    /// Host name, duplicated out of the blob for diagnostics.
    pub name: String,

    /// Full `<HOST>` XML blob.
    pub body: String,

    /// Timestamp of the last accepted sample.
    pub last_mon_time: DateTime<Utc>,
}

impl HostRow {
    pub fn from_record(record: &HostRecord) -> Self {
        Self {
            oid: record.id,
            name: record.name.clone(),
            body: record.to_xml(),
            last_mon_time: record.last_monitor_time,
        }
    }

    pub fn to_record(&self) -> Result<HostRecord, StorageError> {
        HostRecord::from_xml(&self.body)
            .map_err(|e| StorageError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MonitorEvent;
    use crate::record::MonitoringRecord;
    use pretty_assertions::assert_eq;

    #[test]
    fn row_round_trip() {
        let mut record = HostRecord::new(7, "node07", "collectd");
        record.apply(MonitorEvent::CycleStarted);
        record.absorb(
            MonitoringRecord::parse(
                7,
                DateTime::from_timestamp(42, 0).unwrap(),
                "FREE_CPU=40\n",
            )
            .unwrap(),
        );
        record.apply(MonitorEvent::SampleReceived);

        let row = HostRow::from_record(&record);
        assert_eq!(row.oid, 7);
        assert_eq!(row.name, "node07");
        assert_eq!(row.last_mon_time, record.last_monitor_time);

        assert_eq!(row.to_record().unwrap(), record);
    }

    #[test]
    fn corrupt_blob_is_a_serialization_error() {
        let row = HostRow {
            oid: 1,
            name: "x".to_string(),
            body: "<HOST><ID>".to_string(),
            last_mon_time: Utc::now(),
        };
        assert!(matches!(
            row.to_record(),
            Err(StorageError::SerializationError(_))
        ));
    }
}
