//! Message types for actor communication

use tokio::sync::oneshot;

use crate::host::{HostRecord, HostState};
use crate::protocol::MessageType;
use crate::record::MonitoringRecord;

/// Commands that can be sent to the HostMonitorManager
#[derive(Debug)]
pub enum ManagerCommand {
    /// A monitoring sample arrived from a driver
    ///
    /// The dispatcher worker already parsed the template payload, so a burst
    /// of samples costs the manager no parse work.
    SampleReceived { sample: MonitoringRecord },

    /// A liveness beacon arrived
    ///
    /// Refreshes the host's monitor time without carrying data.
    BeaconReceived { host_id: i64, timestamp: i64 },

    /// A driver acknowledged a control message (INIT, START_MONITOR, ...)
    ControlAck {
        msg_type: MessageType,
        host_id: i64,
    },

    /// Re-enable a disabled host
    EnableHost {
        host_id: i64,
        respond_to: oneshot::Sender<anyhow::Result<HostState>>,
    },

    /// Take a host out of monitoring
    DisableHost {
        host_id: i64,
        respond_to: oneshot::Sender<anyhow::Result<HostState>>,
    },

    /// Force a host state (operator action, e.g. OFFLINE)
    SetHostState {
        host_id: i64,
        state: HostState,
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    /// Snapshot of one host record
    GetHost {
        host_id: i64,
        respond_to: oneshot::Sender<anyhow::Result<HostRecord>>,
    },

    /// Snapshots of all known hosts
    ListHosts {
        respond_to: oneshot::Sender<anyhow::Result<Vec<HostRecord>>>,
    },

    /// Run a scheduling pass immediately (bypassing the timer)
    ///
    /// Used for testing and manual refresh operations.
    TickNow {
        respond_to: oneshot::Sender<()>,
    },

    /// Gracefully shut down the manager
    Shutdown,
}
