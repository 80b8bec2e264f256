//! Dispatcher - routes decoded messages to the manager
//!
//! A fixed pool of worker tasks drains the bounded queue the listener feeds.
//! Workers share one receiver behind a mutex; whichever worker grabs the lock
//! first takes the next message. Sample payloads are parsed here, on the
//! worker, so the manager only ever sees well-formed records. Failures are
//! per-message: a bad message is logged and dropped, the worker moves on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::manager::ManagerHandle;
use crate::protocol::{Message, MessageType};
use crate::record::MonitoringRecord;

pub struct Dispatcher;

impl Dispatcher {
    /// Spawn `workers` tasks draining `queue` into the manager. The tasks run
    /// until the queue closes (listener shutdown).
    pub fn spawn(
        queue: mpsc::Receiver<Message>,
        workers: usize,
        manager: ManagerHandle,
    ) -> Vec<JoinHandle<()>> {
        let queue = Arc::new(Mutex::new(queue));

        (0..workers.max(1))
            .map(|worker| {
                let queue = queue.clone();
                let manager = manager.clone();

                tokio::spawn(async move {
                    loop {
                        let message = {
                            let mut rx = queue.lock().await;
                            rx.recv().await
                        };

                        let Some(message) = message else {
                            debug!("dispatcher queue closed, worker {worker} exiting");
                            break;
                        };

                        trace!(
                            "worker {worker}: routing {} for host {}",
                            message.msg_type, message.host_id
                        );
                        route(&manager, message).await;
                    }
                })
            })
            .collect()
    }
}

async fn route(manager: &ManagerHandle, message: Message) {
    match message.msg_type {
        MessageType::MonitorHost | MessageType::MonitorVm | MessageType::SystemHost => {
            // parse on the worker so a burst of samples never serializes
            // behind the manager, and a malformed payload costs exactly
            // this one message
            let host_id = message.host_id;
            let timestamp =
                DateTime::from_timestamp(message.timestamp, 0).unwrap_or_else(Utc::now);
            match MonitoringRecord::parse(host_id, timestamp, &message.payload) {
                Ok(sample) => {
                    if let Err(e) = manager.sample_received(sample).await {
                        warn!("dropping sample: {e}");
                    }
                }
                Err(e) => warn!("host {host_id}: dropping malformed sample: {e}"),
            }
        }

        MessageType::BeaconHost => {
            if let Err(e) = manager.beacon_received(message.host_id, message.timestamp).await {
                warn!("dropping beacon: {e}");
            }
        }

        MessageType::Init
        | MessageType::Finalize
        | MessageType::StartMonitor
        | MessageType::StopMonitor => {
            // driver bookkeeping only, no record update
            if let Err(e) = manager.control_ack(message.msg_type, message.host_id).await {
                warn!("dropping control ack: {e}");
            }
        }
    }
}
