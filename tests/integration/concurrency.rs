//! Concurrent samples across many hosts.

use std::sync::Arc;

use fleet_monitoring::host::HostState;
use fleet_monitoring::protocol::{Message, MessageType};
use fleet_monitoring::storage::memory::MemoryBackend;

use crate::helpers::{engine_with, wait_until};

#[tokio::test]
async fn samples_for_many_hosts_land_independently() {
    let hosts: Vec<i64> = (1..=20).collect();
    let mut engine = engine_with(Arc::new(MemoryBackend::new()), &hosts).await;

    engine.manager.tick_now().await.unwrap();
    for _ in &hosts {
        crate::helpers::next_driver_message(&mut engine.driver_rx).await;
    }

    // all replies fired concurrently from separate sockets
    let mut senders = Vec::new();
    for id in &hosts {
        let id = *id;
        let addr = engine.listener_addr;
        senders.push(tokio::spawn(async move {
            let msg = Message::new(
                MessageType::MonitorHost,
                id,
                100 + id,
                format!("FREE_CPU={}\nUSED_MEMORY={}\n", 100 - id, id * 64),
            );
            crate::helpers::send_message(addr, &msg).await;
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    let manager = engine.manager.clone();
    assert!(
        wait_until(|| {
            let manager = manager.clone();
            async move {
                manager
                    .list_hosts()
                    .await
                    .map(|hosts| hosts.iter().all(|h| h.state == HostState::Monitored))
                    .unwrap_or(false)
            }
        })
        .await
    );

    for id in hosts {
        let record = engine.manager.get_host(id).await.unwrap();
        assert_eq!(record.last_monitor_time.timestamp(), 100 + id);
        let monitoring = record.monitoring.unwrap();
        assert_eq!(
            monitoring.capacity.get("FREE_CPU").and_then(|v| v.as_i64()),
            Some(100 - id)
        );
    }
}

#[tokio::test]
async fn repeated_samples_for_one_host_converge_to_the_latest() {
    let mut engine = engine_with(Arc::new(MemoryBackend::new()), &[7]).await;

    engine.manager.tick_now().await.unwrap();
    crate::helpers::next_driver_message(&mut engine.driver_rx).await;

    for round in 1..=10i64 {
        crate::helpers::send_message(
            engine.listener_addr,
            &Message::new(
                MessageType::MonitorHost,
                7,
                round,
                format!("FREE_CPU={}\n", round),
            ),
        )
        .await;
    }

    let manager = engine.manager.clone();
    assert!(
        wait_until(|| {
            let manager = manager.clone();
            async move {
                manager
                    .get_host(7)
                    .await
                    .map(|h| h.last_monitor_time.timestamp() == 10)
                    .unwrap_or(false)
            }
        })
        .await
    );

    let record = engine.manager.get_host(7).await.unwrap();
    assert_eq!(record.state, HostState::Monitored);
}
