//! Records survive a daemon restart through the durable store.

use std::sync::Arc;
use std::time::Duration;

use fleet_monitoring::host::{HostRecord, HostState, MonitorEvent};
use fleet_monitoring::pool::HostPool;
use fleet_monitoring::protocol::{Message, MessageType};
use fleet_monitoring::record::MonitoringRecord;
use fleet_monitoring::storage::sqlite::SqliteBackend;
use fleet_monitoring::storage::{StorageBackend, memory::MemoryBackend};

use crate::helpers::{engine_with, next_driver_message, send_message, ts, wait_until};

#[tokio::test]
async fn engine_restart_preserves_host_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hosts.db");

    {
        let backend: Arc<dyn StorageBackend> =
            Arc::new(SqliteBackend::new(&path).await.unwrap());
        let mut engine = engine_with(backend.clone(), &[4]).await;

        engine.manager.tick_now().await.unwrap();
        next_driver_message(&mut engine.driver_rx).await;
        send_message(
            engine.listener_addr,
            &Message::new(
                MessageType::MonitorHost,
                4,
                500,
                "FREE_CPU=33\nDS=[ID=0,FREE_MB=100,USED_MB=10]\n".to_string(),
            ),
        )
        .await;

        let manager = engine.manager.clone();
        assert!(
            wait_until(|| {
                let manager = manager.clone();
                async move {
                    manager
                        .get_host(4)
                        .await
                        .map(|h| h.state == HostState::Monitored)
                        .unwrap_or(false)
                }
            })
            .await
        );

        backend.close().await.unwrap();
    }

    // a second engine on the same database, without re-registering the host
    let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(&path).await.unwrap());
    let engine = engine_with(backend, &[]).await;

    let record = engine.manager.get_host(4).await.unwrap();
    assert_eq!(record.name, "node04");
    assert_eq!(record.state, HostState::Monitored);
    assert_eq!(record.last_monitor_time.timestamp(), 500);
    let monitoring = record.monitoring.unwrap();
    assert_eq!(monitoring.datastores.len(), 1);
    assert_eq!(monitoring.capacity.get("FREE_CPU").and_then(|v| v.as_i64()), Some(33));
}

#[tokio::test]
async fn merge_history_is_cumulative_across_restarts() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());

    {
        let pool = HostPool::new(
            store.clone(),
            Duration::from_secs(5),
            chrono::Duration::seconds(600),
        );
        pool.register(HostRecord::new(9, "node09", "udp-push")).await;
        pool.apply_event(9, MonitorEvent::CycleStarted).await.unwrap();
        pool.update_monitoring(
            MonitoringRecord::parse(9, ts(10), "FREE_CPU=40\nHYPERVISOR=\"kvm\"\n").unwrap(),
            MonitorEvent::SampleReceived,
        )
        .await
        .unwrap();
    }

    // new pool, partial update: the old keys must still be there afterwards
    let pool = HostPool::new(
        store,
        Duration::from_secs(5),
        chrono::Duration::seconds(600),
    );
    pool.update_monitoring(
        MonitoringRecord::parse(9, ts(20), "FREE_CPU=35\n").unwrap(),
        MonitorEvent::SampleReceived,
    )
    .await
    .unwrap();

    let record = pool.get(9).await.unwrap();
    let monitoring = record.monitoring.unwrap();
    assert_eq!(monitoring.capacity.get("FREE_CPU").and_then(|v| v.as_i64()), Some(35));
    assert!(monitoring.system.contains_key("HYPERVISOR"));
    assert_eq!(record.last_monitor_time, ts(20));
}
