//! HostMonitorManager - drives monitoring cycles and owns the host pool
//!
//! The manager is the single writer of host state. It reacts to two inputs:
//! decoded messages routed by the dispatcher, and its own periodic timer.
//! Each tick classifies every known host under a brief lock, then issues
//! MONITOR_HOST requests through the driver bindings without holding any
//! lock. Per-host failures are logged and absorbed; the next tick retries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use super::messages::ManagerCommand;
use crate::drivers::DriverRegistry;
use crate::host::{HostRecord, HostState, MonitorEvent};
use crate::pool::{HostPool, PoolError};
use crate::protocol::{Message, MessageType};
use crate::record::MonitoringRecord;

/// Manager timing knobs, decoupled from the config file for tests.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Period of the scheduling timer.
    pub timer_interval: std::time::Duration,

    /// Target interval between monitoring cycles per host.
    pub monitoring_interval: chrono::Duration,

    /// Grace period before an unanswered cycle marks the host ERROR.
    pub timeout: chrono::Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            timer_interval: std::time::Duration::from_secs(15),
            monitoring_interval: chrono::Duration::seconds(180),
            timeout: chrono::Duration::seconds(45),
        }
    }
}

impl From<&crate::config::ManagerConfig> for ManagerSettings {
    fn from(config: &crate::config::ManagerConfig) -> Self {
        Self {
            timer_interval: config.timer_interval(),
            monitoring_interval: config.monitoring_interval(),
            timeout: config.timeout(),
        }
    }
}

pub struct HostMonitorManager {
    pool: Arc<HostPool>,
    drivers: Arc<DriverRegistry>,
    settings: ManagerSettings,

    /// Per-host driver addresses. Runtime-only, never persisted.
    addresses: HashMap<i64, SocketAddr>,

    command_rx: mpsc::Receiver<ManagerCommand>,
}

impl HostMonitorManager {
    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting host monitor manager");

        let mut timer = time::interval(self.settings.timer_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the interval fires immediately; skip that first tick so startup
        // ordering does not race the listener
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.tick(Utc::now()).await;
                }

                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("command channel closed, shutting down");
                        break;
                    };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
            }
        }

        debug!("host monitor manager stopped");
    }

    /// One scheduling pass: time out stuck cycles, start due ones.
    async fn tick(&mut self, now: DateTime<Utc>) {
        let due = match self
            .pool
            .collect_due(now, self.settings.monitoring_interval, self.settings.timeout)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!("scheduling pass failed: {e}");
                return;
            }
        };

        trace!(
            "tick: {} due, {} timed out",
            due.due.len(),
            due.timed_out.len()
        );

        for host_id in due.timed_out {
            match self.pool.apply_event(host_id, MonitorEvent::TimeoutElapsed).await {
                Ok(Some(state)) => warn!("host {host_id} monitoring timed out, now {state}"),
                Ok(None) => {}
                Err(e) => error!("host {host_id}: cannot record timeout: {e}"),
            }
        }

        for host_id in due.due {
            self.start_cycle(host_id, now).await;
        }
    }

    async fn start_cycle(&mut self, host_id: i64, now: DateTime<Utc>) {
        let record = match self.pool.get(host_id).await {
            Ok(record) => record,
            Err(e) => {
                error!("host {host_id}: cannot start cycle: {e}");
                return;
            }
        };

        // ERROR hosts have no cycle-started edge; the request is re-issued
        // with the state left as is until a sample recovers the host
        if let Err(e) = self.pool.apply_event(host_id, MonitorEvent::CycleStarted).await {
            error!("host {host_id}: cannot start cycle: {e}");
            return;
        }

        let message = Message::new(MessageType::MonitorHost, host_id, now.timestamp(), String::new());
        if let Err(e) = self
            .drivers
            .send(&record.im_mad, self.addresses.get(&host_id).copied(), &message)
            .await
        {
            warn!("host {host_id}: monitor request not delivered: {e}");
        }
    }

    /// Absorb a monitoring sample already parsed by a dispatcher worker.
    /// An unknown host costs exactly this one message.
    async fn handle_sample(&mut self, sample: MonitoringRecord) {
        let host_id = sample.host_id;

        match self
            .pool
            .update_monitoring(sample, MonitorEvent::SampleReceived)
            .await
        {
            Ok(Some(state)) => trace!("host {host_id}: sample accepted, state {state}"),
            Ok(None) => debug!("host {host_id}: sample data kept, no state change"),
            Err(PoolError::HostUnknown(_)) => {
                warn!("dropping sample for unknown host {host_id}");
            }
            Err(PoolError::Storage(e)) => {
                // the cached record keeps the sample; flag the host so
                // readers see the degradation
                error!("host {host_id}: write-through failed: {e}");
                if let Err(e) = self.pool.set_host_state(host_id, HostState::Error).await {
                    error!("host {host_id}: cannot flag storage failure: {e}");
                }
            }
        }
    }

    async fn handle_beacon(&mut self, host_id: i64, timestamp: i64) {
        let timestamp = DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now);
        let beacon = MonitoringRecord::empty(host_id, timestamp);

        match self
            .pool
            .update_monitoring(beacon, MonitorEvent::SampleReceived)
            .await
        {
            Ok(_) => trace!("host {host_id}: beacon"),
            Err(PoolError::HostUnknown(_)) => warn!("dropping beacon for unknown host {host_id}"),
            Err(e) => error!("host {host_id}: beacon not recorded: {e}"),
        }
    }

    /// Drive the enable/disable edge and notify the host's driver.
    async fn set_enabled(&mut self, host_id: i64, enabled: bool) -> anyhow::Result<HostState> {
        let (event, control) = if enabled {
            (MonitorEvent::Enable, MessageType::StartMonitor)
        } else {
            (MonitorEvent::Disable, MessageType::StopMonitor)
        };

        let state = self
            .pool
            .apply_event(host_id, event)
            .await?
            .ok_or_else(|| anyhow::anyhow!("host {host_id}: transition rejected"))?;

        let record = self.pool.get(host_id).await?;
        let message = Message::new(control, host_id, Utc::now().timestamp(), String::new());
        if let Err(e) = self
            .drivers
            .send(&record.im_mad, self.addresses.get(&host_id).copied(), &message)
            .await
        {
            // the driver missing a control message is not fatal to the
            // state change
            warn!("host {host_id}: {control} not delivered: {e}");
        }

        info!("host {host_id} now {state}");
        Ok(state)
    }

    /// Handle a command; returns false to stop the actor.
    async fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
        match cmd {
            ManagerCommand::SampleReceived { sample } => {
                self.handle_sample(sample).await;
            }

            ManagerCommand::BeaconReceived { host_id, timestamp } => {
                self.handle_beacon(host_id, timestamp).await;
            }

            ManagerCommand::ControlAck { msg_type, host_id } => {
                debug!("host {host_id}: driver acknowledged {msg_type}");
            }

            ManagerCommand::EnableHost {
                host_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_enabled(host_id, true).await);
            }

            ManagerCommand::DisableHost {
                host_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_enabled(host_id, false).await);
            }

            ManagerCommand::SetHostState {
                host_id,
                state,
                respond_to,
            } => {
                let result = self
                    .pool
                    .set_host_state(host_id, state)
                    .await
                    .map_err(Into::into);
                let _ = respond_to.send(result);
            }

            ManagerCommand::GetHost {
                host_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.pool.get(host_id).await.map_err(Into::into));
            }

            ManagerCommand::ListHosts { respond_to } => {
                let _ = respond_to.send(self.pool.list_hosts().await.map_err(Into::into));
            }

            ManagerCommand::TickNow { respond_to } => {
                self.tick(Utc::now()).await;
                let _ = respond_to.send(());
            }

            ManagerCommand::Shutdown => {
                debug!("received shutdown command");
                return false;
            }
        }

        true
    }
}

/// Handle for controlling the HostMonitorManager
#[derive(Clone)]
pub struct ManagerHandle {
    sender: mpsc::Sender<ManagerCommand>,
}

impl ManagerHandle {
    /// Spawn the manager actor; the returned task ends on shutdown.
    pub fn spawn(
        pool: Arc<HostPool>,
        drivers: Arc<DriverRegistry>,
        settings: ManagerSettings,
        addresses: HashMap<i64, SocketAddr>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let actor = HostMonitorManager {
            pool,
            drivers,
            settings,
            addresses,
            command_rx: cmd_rx,
        };

        let task = tokio::spawn(actor.run());
        (Self { sender: cmd_tx }, task)
    }

    pub async fn sample_received(&self, sample: MonitoringRecord) -> anyhow::Result<()> {
        self.sender
            .send(ManagerCommand::SampleReceived { sample })
            .await?;
        Ok(())
    }

    pub async fn beacon_received(&self, host_id: i64, timestamp: i64) -> anyhow::Result<()> {
        self.sender
            .send(ManagerCommand::BeaconReceived { host_id, timestamp })
            .await?;
        Ok(())
    }

    pub async fn control_ack(&self, msg_type: MessageType, host_id: i64) -> anyhow::Result<()> {
        self.sender
            .send(ManagerCommand::ControlAck { msg_type, host_id })
            .await?;
        Ok(())
    }

    pub async fn enable_host(&self, host_id: i64) -> anyhow::Result<HostState> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::EnableHost {
                host_id,
                respond_to: tx,
            })
            .await?;
        rx.await?
    }

    pub async fn disable_host(&self, host_id: i64) -> anyhow::Result<HostState> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::DisableHost {
                host_id,
                respond_to: tx,
            })
            .await?;
        rx.await?
    }

    pub async fn set_host_state(&self, host_id: i64, state: HostState) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::SetHostState {
                host_id,
                state,
                respond_to: tx,
            })
            .await?;
        rx.await?
    }

    pub async fn get_host(&self, host_id: i64) -> anyhow::Result<HostRecord> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::GetHost {
                host_id,
                respond_to: tx,
            })
            .await?;
        rx.await?
    }

    pub async fn list_hosts(&self) -> anyhow::Result<Vec<HostRecord>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::ListHosts { respond_to: tx })
            .await?;
        rx.await?
    }

    /// Run a scheduling pass immediately and wait for it to finish.
    pub async fn tick_now(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::TickNow { respond_to: tx })
            .await?;
        rx.await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(ManagerCommand::Shutdown).await;
    }
}
