//! Host records and the monitoring state machine.
//!
//! A host moves through its states only along the edges below; anything else
//! is rejected and logged by the caller:
//!
//! ```text
//! INIT       --cycle started--> MONITORING
//! MONITORING --sample--------->  MONITORED
//! MONITORING --timeout-------->  ERROR
//! MONITORED  --cycle started--> MONITORING
//! ERROR      --sample--------->  MONITORED
//! any        --disable-------->  DISABLED
//! DISABLED   --enable--------->  INIT
//! ```
//!
//! `OFFLINE` is an operator-set state: offline hosts are never scheduled and
//! leave that state only through an explicit state change.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{MonitoringRecord, RecordError};
use crate::xml;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    Init,
    Monitoring,
    Monitored,
    Error,
    Disabled,
    Offline,
}

impl HostState {
    /// Numeric form used in the persisted XML (external readers parse it).
    pub fn as_i32(self) -> i32 {
        match self {
            HostState::Init => 0,
            HostState::Monitoring => 1,
            HostState::Monitored => 2,
            HostState::Error => 3,
            HostState::Disabled => 4,
            HostState::Offline => 5,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(HostState::Init),
            1 => Some(HostState::Monitoring),
            2 => Some(HostState::Monitored),
            3 => Some(HostState::Error),
            4 => Some(HostState::Disabled),
            5 => Some(HostState::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Init => "INIT",
            HostState::Monitoring => "MONITORING",
            HostState::Monitored => "MONITORED",
            HostState::Error => "ERROR",
            HostState::Disabled => "DISABLED",
            HostState::Offline => "OFFLINE",
        };
        write!(f, "{name}")
    }
}

/// Events driving the host state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    CycleStarted,
    SampleReceived,
    TimeoutElapsed,
    Disable,
    Enable,
}

/// The target state for `event` in `from`, or `None` when the table has no
/// such edge.
pub fn transition(from: HostState, event: MonitorEvent) -> Option<HostState> {
    use HostState::*;
    use MonitorEvent::*;

    match (from, event) {
        (Init, CycleStarted) => Some(Monitoring),
        (Monitored, CycleStarted) => Some(Monitoring),
        (Monitoring, SampleReceived) => Some(Monitored),
        (Error, SampleReceived) => Some(Monitored),
        // a repeated sample keeps the host monitored; not a state change
        (Monitored, SampleReceived) => Some(Monitored),
        (Monitoring, TimeoutElapsed) => Some(Error),
        (Disabled, Enable) => Some(Init),
        (_, Disable) => Some(Disabled),
        _ => None,
    }
}

/// One monitored host: identity, state, and its latest sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Externally assigned, immutable id.
    pub id: i64,
    pub name: String,
    pub state: HostState,
    pub prev_state: HostState,

    /// Name of the monitoring driver responsible for this host.
    pub im_mad: String,
    pub vm_mad: String,
    pub cluster_id: i64,
    pub cluster: String,

    /// VMs currently placed on this host.
    pub vm_ids: Vec<i64>,

    /// Timestamp of the last accepted sample or beacon. Monotonically
    /// non-decreasing; use [`HostRecord::touch`].
    pub last_monitor_time: DateTime<Utc>,

    /// Latest monitoring sample, absent before the first one arrives.
    pub monitoring: Option<MonitoringRecord>,
}

impl HostRecord {
    pub fn new(id: i64, name: impl Into<String>, im_mad: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: HostState::Init,
            prev_state: HostState::Init,
            im_mad: im_mad.into(),
            vm_mad: String::new(),
            cluster_id: -1,
            cluster: String::new(),
            vm_ids: Vec::new(),
            last_monitor_time: DateTime::<Utc>::UNIX_EPOCH,
            monitoring: None,
        }
    }

    /// Set the state, remembering the previous one for recovery/debugging.
    pub fn set_state(&mut self, state: HostState) {
        if self.state != state {
            self.prev_state = self.state;
            self.state = state;
        }
    }

    /// Apply a state-machine event. Returns the new state, or `None` when the
    /// table has no edge for it (state unchanged).
    pub fn apply(&mut self, event: MonitorEvent) -> Option<HostState> {
        let next = transition(self.state, event)?;
        self.set_state(next);
        Some(next)
    }

    /// Advance `last_monitor_time`, never moving it backwards.
    pub fn touch(&mut self, timestamp: DateTime<Utc>) {
        if timestamp > self.last_monitor_time {
            self.last_monitor_time = timestamp;
        }
    }

    /// A record is stale once no sample has arrived within `expiration`.
    /// Staleness is a derived flag for readers, never an eviction trigger.
    pub fn is_stale(&self, expiration: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_monitor_time > expiration
    }

    /// Sticky-merge a sample into the record and advance the monitor time.
    pub fn absorb(&mut self, sample: MonitoringRecord) {
        self.touch(sample.timestamp);
        match &mut self.monitoring {
            Some(current) => current.merge(sample),
            None => self.monitoring = Some(sample),
        }
    }

    /// Serialize to the `<HOST>` schema consumed by the rest of the platform.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();

        out.push_str("<HOST>");
        xml::print_tag(&mut out, "ID", self.id);
        xml::print_tag(&mut out, "NAME", &self.name);
        xml::print_tag(&mut out, "STATE", self.state.as_i32());
        xml::print_tag(&mut out, "PREV_STATE", self.prev_state.as_i32());
        xml::print_tag(&mut out, "IM_MAD", &self.im_mad);
        xml::print_tag(&mut out, "VM_MAD", &self.vm_mad);
        xml::print_tag(&mut out, "CLUSTER_ID", self.cluster_id);
        xml::print_tag(&mut out, "CLUSTER", &self.cluster);
        xml::print_tag(&mut out, "LAST_MON_TIME", self.last_monitor_time.timestamp());

        out.push_str("<VMS>");
        for vm in &self.vm_ids {
            xml::print_tag(&mut out, "ID", vm);
        }
        out.push_str("</VMS>");

        if let Some(monitoring) = &self.monitoring {
            monitoring.write_xml(&mut out);
        }

        out.push_str("</HOST>");
        out
    }

    pub fn from_xml(xml_str: &str) -> Result<Self, RecordError> {
        let doc = roxmltree::Document::parse(xml_str)
            .map_err(|e| RecordError::MalformedXml(e.to_string()))?;
        let root = doc.root_element();

        if root.tag_name().name() != "HOST" {
            return Err(RecordError::MalformedXml(format!(
                "expected HOST element, found {}",
                root.tag_name().name()
            )));
        }

        let id = xml::child_text(root, "ID")
            .and_then(|t| t.trim().parse().ok())
            .ok_or_else(|| RecordError::MalformedXml("missing or invalid ID".to_string()))?;

        let state_num: i32 = xml::child_text(root, "STATE")
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or_default();
        let prev_num: i32 = xml::child_text(root, "PREV_STATE")
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or_default();

        let mut record = HostRecord::new(
            id,
            xml::child_text(root, "NAME").unwrap_or_default(),
            xml::child_text(root, "IM_MAD").unwrap_or_default(),
        );

        record.state = HostState::from_i32(state_num).unwrap_or(HostState::Init);
        record.prev_state = HostState::from_i32(prev_num).unwrap_or(HostState::Init);
        record.vm_mad = xml::child_text(root, "VM_MAD").unwrap_or_default().to_string();
        record.cluster_id = xml::child_text(root, "CLUSTER_ID")
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or(-1);
        record.cluster = xml::child_text(root, "CLUSTER").unwrap_or_default().to_string();

        let epoch: i64 = xml::child_text(root, "LAST_MON_TIME")
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or_default();
        record.last_monitor_time = DateTime::from_timestamp(epoch, 0).unwrap_or_default();

        if let Some(vms) = xml::child(root, "VMS") {
            record.vm_ids = vms
                .children()
                .filter(|c| c.is_element() && c.tag_name().name() == "ID")
                .filter_map(|c| c.text().and_then(|t| t.trim().parse().ok()))
                .collect();
        }

        if let Some(monitoring) = xml::child(root, "MONITORING") {
            record.monitoring = Some(MonitoringRecord::from_xml_node(monitoring)?);
        }

        Ok(record)
    }
}
