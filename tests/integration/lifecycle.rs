//! End-to-end monitoring lifecycle over the real UDP pipeline.

use std::sync::Arc;

use fleet_monitoring::host::HostState;
use fleet_monitoring::protocol::{Message, MessageType};
use fleet_monitoring::storage::memory::MemoryBackend;

use crate::helpers::{engine_with, next_driver_message, send_message, wait_until};

#[tokio::test]
async fn full_cycle_from_request_to_monitored() {
    let mut engine = engine_with(Arc::new(MemoryBackend::new()), &[1]).await;

    engine.manager.tick_now().await.unwrap();
    let request = next_driver_message(&mut engine.driver_rx).await;
    assert_eq!(request.msg_type, MessageType::MonitorHost);
    assert_eq!(request.host_id, 1);

    // the driver answers over the wire
    send_message(
        engine.listener_addr,
        &Message::new(
            MessageType::MonitorHost,
            1,
            100,
            "FREE_CPU=40\nFREE_MEMORY=2048\nHYPERVISOR=\"kvm\"\n".to_string(),
        ),
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

    let record = engine.manager.get_host(1).await.unwrap();
    assert_eq!(record.last_monitor_time.timestamp(), 100);
    let monitoring = record.monitoring.unwrap();
    assert_eq!(monitoring.capacity.len(), 2);
    assert_eq!(monitoring.system.len(), 1);
}

/// A full sample followed by a data-less beacon: the beacon advances the
/// monitor time but erases nothing.
#[tokio::test]
async fn beacon_after_full_sample_keeps_capacity() {
    let mut engine = engine_with(Arc::new(MemoryBackend::new()), &[5]).await;

    engine.manager.tick_now().await.unwrap();
    next_driver_message(&mut engine.driver_rx).await;

    send_message(
        engine.listener_addr,
        &Message::new(
            MessageType::MonitorHost,
            5,
            100,
            "FREE_CPU=40\nUSED_MEMORY=512\nDS=[ID=1,FREE_MB=9000,USED_MB=100]\n".to_string(),
        ),
    )
    .await;

    let manager = engine.manager.clone();
    assert!(
        wait_until(|| {
            let manager = manager.clone();
            async move {
                manager
                    .get_host(5)
                    .await
                    .map(|h| h.state == HostState::Monitored)
                    .unwrap_or(false)
            }
        })
        .await
    );

    send_message(
        engine.listener_addr,
        &Message::new(MessageType::BeaconHost, 5, 160, String::new()),
    )
    .await;

    let manager = engine.manager.clone();
    assert!(
        wait_until(|| {
            let manager = manager.clone();
            async move {
                manager
                    .get_host(5)
                    .await
                    .map(|h| h.last_monitor_time.timestamp() == 160)
                    .unwrap_or(false)
            }
        })
        .await
    );

    let record = engine.manager.get_host(5).await.unwrap();
    assert_eq!(record.state, HostState::Monitored);
    let monitoring = record.monitoring.unwrap();
    assert_eq!(monitoring.capacity.len(), 2);
    assert_eq!(monitoring.datastores.len(), 1);
}

/// A beacon alone is enough to bring an ERROR host back: it takes the
/// sample edge and leaves every previously reported value in place.
#[tokio::test]
async fn beacon_recovers_error_host_with_data_intact() {
    let mut engine = engine_with(Arc::new(MemoryBackend::new()), &[5]).await;

    engine.manager.tick_now().await.unwrap();
    next_driver_message(&mut engine.driver_rx).await;
    send_message(
        engine.listener_addr,
        &Message::new(MessageType::MonitorHost, 5, 0, "CPU=40\n".to_string()),
    )
    .await;

    let manager = engine.manager.clone();
    assert!(
        wait_until(|| {
            let manager = manager.clone();
            async move {
                manager
                    .get_host(5)
                    .await
                    .map(|h| h.state == HostState::Monitored)
                    .unwrap_or(false)
            }
        })
        .await
    );

    // new cycle, never answered; the record's epoch-old age trips the
    // timeout on the following pass
    engine.manager.tick_now().await.unwrap();
    next_driver_message(&mut engine.driver_rx).await;
    engine.manager.tick_now().await.unwrap();
    assert_eq!(
        engine.manager.get_host(5).await.unwrap().state,
        HostState::Error
    );

    send_message(
        engine.listener_addr,
        &Message::new(MessageType::BeaconHost, 5, 226, String::new()),
    )
    .await;

    let manager = engine.manager.clone();
    assert!(
        wait_until(|| {
            let manager = manager.clone();
            async move {
                manager
                    .get_host(5)
                    .await
                    .map(|h| h.state == HostState::Monitored)
                    .unwrap_or(false)
            }
        })
        .await
    );

    let record = engine.manager.get_host(5).await.unwrap();
    assert_eq!(record.last_monitor_time.timestamp(), 226);
    let monitoring = record.monitoring.unwrap();
    assert_eq!(
        monitoring.capacity.get("CPU"),
        Some(&fleet_monitoring::record::AttributeValue::Integer(40))
    );
}

#[tokio::test]
async fn unanswered_cycle_degrades_to_error_and_recovers() {
    let mut engine = engine_with(Arc::new(MemoryBackend::new()), &[2]).await;

    // start a cycle, never answer it; the record's epoch age is far past
    // interval + timeout, so the next pass times it out
    engine.manager.tick_now().await.unwrap();
    next_driver_message(&mut engine.driver_rx).await;
    engine.manager.tick_now().await.unwrap();

    assert_eq!(
        engine.manager.get_host(2).await.unwrap().state,
        HostState::Error
    );

    // a late sample recovers the host without an intervening cycle
    send_message(
        engine.listener_addr,
        &Message::new(MessageType::MonitorHost, 2, 50, "FREE_CPU=9\n".to_string()),
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
}

#[tokio::test]
async fn disable_enable_round_trip_over_the_wire() {
    let mut engine = engine_with(Arc::new(MemoryBackend::new()), &[3]).await;

    assert_eq!(
        engine.manager.disable_host(3).await.unwrap(),
        HostState::Disabled
    );
    let stop = next_driver_message(&mut engine.driver_rx).await;
    assert_eq!(stop.msg_type, MessageType::StopMonitor);

    // disabled hosts are invisible to the scheduler
    engine.manager.tick_now().await.unwrap();
    assert!(engine.driver_rx.try_recv().is_err());

    assert_eq!(
        engine.manager.enable_host(3).await.unwrap(),
        HostState::Init
    );
    let start = next_driver_message(&mut engine.driver_rx).await;
    assert_eq!(start.msg_type, MessageType::StartMonitor);

    // and the next pass schedules it again
    engine.manager.tick_now().await.unwrap();
    let request = next_driver_message(&mut engine.driver_rx).await;
    assert_eq!(request.msg_type, MessageType::MonitorHost);
    assert_eq!(request.host_id, 3);
}
