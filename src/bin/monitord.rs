use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fleet_monitoring::{
    actors::{
        dispatcher::Dispatcher,
        manager::{ManagerHandle, ManagerSettings},
    },
    config::{Config, HostConfig, StorageConfig, read_config_file},
    drivers::DriverRegistry,
    host::HostRecord,
    pool::HostPool,
    storage::{StorageBackend, memory::MemoryBackend, postgres::PostgresBackend, sqlite::SqliteBackend},
    transport::{MessageSecurity, UdpListener},
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleet_monitoring", LevelFilter::TRACE),
        ("monitord", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    banner(&config);

    let store = open_storage(config.storage.as_ref().cloned().unwrap_or_default()).await?;
    startup_diagnostics(store.as_ref()).await;

    let pool = Arc::new(HostPool::new(
        store.clone(),
        config.manager.storage_timeout(),
        config.manager.expiration(),
    ));
    let addresses = register_hosts(&pool, &config.hosts).await?;

    let security = match &config.listener.prikey {
        Some(path) => MessageSecurity::load(path)?,
        None => {
            warn!("no private key configured, messages travel in the clear");
            MessageSecurity::disabled()
        }
    };

    let bind_addr: SocketAddr =
        format!("{}:{}", config.listener.address, config.listener.port).parse()?;
    let listener = UdpListener::bind(
        bind_addr,
        config.listener.threads,
        config.listener.max_message_size,
        security,
    )
    .await?;
    let stats = listener.stats();

    // malformed driver descriptors abort here, before anything is spawned,
    // and so does a host referencing a driver that does not exist
    let drivers = Arc::new(DriverRegistry::load(&config.drivers, listener.sender())?);
    drivers.validate_hosts(&config.hosts)?;

    let (manager, manager_task) = ManagerHandle::spawn(
        pool,
        drivers,
        ManagerSettings::from(&config.manager),
        addresses,
    );

    let (queue_tx, queue_rx) = tokio::sync::mpsc::channel(config.listener.backlog);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reader_tasks = listener.spawn(queue_tx, shutdown_rx);
    let worker_tasks = Dispatcher::spawn(queue_rx, config.listener.threads, manager.clone());

    info!("monitord up, listening on {}", listener.local_addr()?);

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    // stop intake first, then let in-flight work drain
    let _ = shutdown_tx.send(true);
    manager.shutdown().await;

    let drain = async {
        for task in reader_tasks.into_iter().chain(worker_tasks) {
            let _ = task.await;
        }
        let _ = manager_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("grace period elapsed, abandoning remaining tasks");
    }

    let snapshot = stats.snapshot();
    info!(
        "transport totals: {} received, {} sent, {} dropped (decrypt {}, oversized {}, malformed {}, backlog {})",
        snapshot.received,
        snapshot.sent,
        snapshot.decrypt_failures + snapshot.oversized + snapshot.malformed + snapshot.backlog_dropped,
        snapshot.decrypt_failures,
        snapshot.oversized,
        snapshot.malformed,
        snapshot.backlog_dropped,
    );

    if let Err(e) = store.close().await {
        error!("error closing storage: {e}");
    }

    info!("monitord stopped");
    Ok(())
}

/// Log the effective configuration once at startup.
fn banner(config: &Config) {
    info!(
        "monitord {} starting",
        option_env!("CARGO_PKG_VERSION").unwrap_or("dev")
    );
    info!(
        "listener: {}:{} ({} threads, backlog {}, max message {} bytes)",
        config.listener.address,
        config.listener.port,
        config.listener.threads,
        config.listener.backlog,
        config.listener.max_message_size,
    );
    info!(
        "manager: timer {}s, monitoring interval {}s, timeout {}s, expiration {}s",
        config.manager.timer_interval,
        config.manager.monitoring_interval,
        config.manager.timeout,
        config.manager.expiration,
    );
    info!(
        "{} drivers, {} hosts configured",
        config.drivers.len(),
        config.hosts.len()
    );
}

async fn open_storage(config: StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    Ok(match config {
        StorageConfig::None => {
            warn!("storage disabled, host records will not survive a restart");
            Arc::new(MemoryBackend::new())
        }
        StorageConfig::Sqlite { path } => Arc::new(SqliteBackend::new(path).await?),
        StorageConfig::Postgres {
            url,
            max_connections,
        } => Arc::new(PostgresBackend::new(&url, max_connections).await?),
    })
}

/// One bulk scan at startup, for the log only; the cache warms lazily.
async fn startup_diagnostics(store: &dyn StorageBackend) {
    match store.health_check().await {
        Ok(health) => info!("storage: {}", health.message),
        Err(e) => warn!("storage health check failed: {e}"),
    }

    match store.scan().await {
        Ok(rows) => {
            info!("{} host records carried over from previous runs", rows.len());
            for row in &rows {
                debug!(
                    "  host {} ({}), last monitored {}",
                    row.oid, row.name, row.last_mon_time
                );
            }
        }
        Err(e) => warn!("storage scan failed: {e}"),
    }
}

/// Register configured hosts and collect their runtime driver addresses.
async fn register_hosts(
    pool: &HostPool,
    hosts: &[HostConfig],
) -> anyhow::Result<HashMap<i64, SocketAddr>> {
    let mut addresses = HashMap::new();

    for host in hosts {
        if let Some(raw) = &host.address {
            let addr: SocketAddr = raw
                .parse()
                .map_err(|_| anyhow::anyhow!("host {}: bad address {raw:?}", host.id))?;
            addresses.insert(host.id, addr);
        }

        let mut record = HostRecord::new(host.id, host.name.clone(), host.im_mad.clone());
        record.vm_mad = host.vm_mad.clone();
        record.cluster_id = host.cluster_id;
        record.cluster = host.cluster.clone();
        pool.register(record).await;
    }

    Ok(addresses)
}
