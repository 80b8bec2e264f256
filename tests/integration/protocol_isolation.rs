//! Bad input on the wire must cost exactly one message.

use std::sync::Arc;

use fleet_monitoring::host::HostState;
use fleet_monitoring::protocol::{Message, MessageType};
use fleet_monitoring::storage::memory::MemoryBackend;

use crate::helpers::{engine_with, next_driver_message, send_message, send_raw, wait_until};

#[tokio::test]
async fn garbage_datagram_does_not_block_valid_traffic() {
    let mut engine = engine_with(Arc::new(MemoryBackend::new()), &[1]).await;

    engine.manager.tick_now().await.unwrap();
    next_driver_message(&mut engine.driver_rx).await;

    send_raw(engine.listener_addr, b"complete nonsense\n").await;
    send_raw(engine.listener_addr, b"MONITOR_HOST not-a-number 0 -\n").await;
    send_message(
        engine.listener_addr,
        &Message::new(MessageType::MonitorHost, 1, 10, "FREE_CPU=1\n".to_string()),
    )
    .await;

    let manager = engine.manager.clone();
    assert!(
        wait_until(|| {
            let manager = manager.clone();
            async move {
                manager
                    .get_host(1)
                    .await
                    .map(|h| h.state == HostState::Monitored)
                    .unwrap_or(false)
            }
        })
        .await
    );

    let stats = engine.stats.clone();
    assert!(
        wait_until(|| {
            let stats = stats.clone();
            async move { stats.snapshot().malformed == 2 }
        })
        .await
    );
    assert_eq!(engine.stats.snapshot().received, 3);
}

#[tokio::test]
async fn malformed_payload_for_one_host_leaves_others_alone() {
    let mut engine = engine_with(Arc::new(MemoryBackend::new()), &[1, 2]).await;

    engine.manager.tick_now().await.unwrap();
    next_driver_message(&mut engine.driver_rx).await;
    next_driver_message(&mut engine.driver_rx).await;

    // valid envelope, unparsable template payload
    send_message(
        engine.listener_addr,
        &Message::new(
            MessageType::MonitorHost,
            1,
            10,
            "there are no pairs here".to_string(),
        ),
    )
    .await;
    send_message(
        engine.listener_addr,
        &Message::new(MessageType::MonitorHost, 2, 10, "FREE_CPU=2\n".to_string()),
    )
    .await;

    let manager = engine.manager.clone();
    assert!(
        wait_until(|| {
            let manager = manager.clone();
            async move {
                manager
                    .get_host(2)
                    .await
                    .map(|h| h.state == HostState::Monitored)
                    .unwrap_or(false)
            }
        })
        .await
    );

    // host 1 is still mid-cycle, its bad sample changed nothing
    let record = engine.manager.get_host(1).await.unwrap();
    assert_eq!(record.state, HostState::Monitoring);
    assert!(record.monitoring.is_none());
}

#[tokio::test]
async fn sample_for_unregistered_host_is_ignored() {
    let engine = engine_with(Arc::new(MemoryBackend::new()), &[1]).await;

    send_message(
        engine.listener_addr,
        &Message::new(MessageType::MonitorHost, 99, 10, "FREE_CPU=1\n".to_string()),
    )
    .await;

    // give the pipeline a moment, then confirm nothing appeared
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(engine.manager.get_host(99).await.is_err());
    assert_eq!(engine.manager.list_hosts().await.unwrap().len(), 1);
}
