//! Shared fixtures: a fully wired engine (listener, dispatcher, manager,
//! pool) over a caller-supplied storage backend, plus a fake driver endpoint
//! whose inbox the tests can inspect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_monitoring::actors::dispatcher::Dispatcher;
use fleet_monitoring::actors::manager::{ManagerHandle, ManagerSettings};
use fleet_monitoring::config::{DriverConfig, DriverEndpointConfig};
use fleet_monitoring::drivers::DriverRegistry;
use fleet_monitoring::host::HostRecord;
use fleet_monitoring::pool::HostPool;
use fleet_monitoring::protocol::Message;
use fleet_monitoring::storage::StorageBackend;
use fleet_monitoring::transport::{MessageSecurity, TransportStats, UdpListener};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

pub const DRIVER_NAME: &str = "udp-push";

pub struct Engine {
    pub manager: ManagerHandle,
    pub pool: Arc<HostPool>,

    /// Where drivers send their samples.
    pub listener_addr: SocketAddr,

    /// Outbound messages the engine sent to "the driver".
    pub driver_rx: mpsc::Receiver<Message>,

    pub stats: Arc<TransportStats>,

    _shutdown: watch::Sender<bool>,
}

/// Wire up the whole receive path over `store`, with `hosts` registered
/// against a single UDP driver.
pub async fn engine_with(store: Arc<dyn StorageBackend>, hosts: &[i64]) -> Engine {
    // the fake driver endpoint
    let driver_side = UdpListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        1,
        4096,
        MessageSecurity::disabled(),
    )
    .await
    .unwrap();
    let driver_addr = driver_side.local_addr().unwrap();
    let (driver_tx, driver_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    driver_side.spawn(driver_tx, shutdown_rx.clone());

    // the engine listener
    let listener = UdpListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        2,
        4096,
        MessageSecurity::disabled(),
    )
    .await
    .unwrap();
    let listener_addr = listener.local_addr().unwrap();
    let stats = listener.stats();

    let drivers = Arc::new(
        DriverRegistry::load(
            &[DriverConfig {
                name: DRIVER_NAME.to_string(),
                endpoint: DriverEndpointConfig::Udp {
                    address: Some(driver_addr.to_string()),
                    public_key: None,
                },
            }],
            listener.sender(),
        )
        .unwrap(),
    );

    let pool = Arc::new(HostPool::new(
        store,
        Duration::from_secs(5),
        chrono::Duration::seconds(600),
    ));
    for id in hosts {
        pool.register(HostRecord::new(*id, format!("node{id:02}"), DRIVER_NAME))
            .await;
    }

    let settings = ManagerSettings {
        // only tick_now drives the tests
        timer_interval: Duration::from_secs(3600),
        monitoring_interval: chrono::Duration::seconds(60),
        timeout: chrono::Duration::seconds(30),
    };
    let (manager, _task) =
        ManagerHandle::spawn(pool.clone(), drivers, settings, HashMap::new());

    let (queue_tx, queue_rx) = mpsc::channel(64);
    listener.spawn(queue_tx, shutdown_rx);
    Dispatcher::spawn(queue_rx, 2, manager.clone());

    Engine {
        manager,
        pool,
        listener_addr,
        driver_rx,
        stats,
        _shutdown: shutdown_tx,
    }
}

/// Send one encoded message to the engine over a throwaway socket.
pub async fn send_message(addr: SocketAddr, message: &Message) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&message.encode(4096).unwrap(), addr)
        .await
        .unwrap();
}

/// Send raw bytes to the engine, for malformed-input tests.
pub async fn send_raw(addr: SocketAddr, raw: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(raw, addr).await.unwrap();
}

pub async fn next_driver_message(rx: &mut mpsc::Receiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no driver message within 2s")
        .expect("driver channel closed")
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn wait_until<Fut>(mut check: impl FnMut() -> Fut) -> bool
where
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}
