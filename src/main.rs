use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slotbook::booking::ReservationService;
use slotbook::config::{Config, StoreKind};
use slotbook::limits::ORPHAN_MIN_AGE_MS;
use slotbook::model::BookingEvent;
use slotbook::notify::NotifyHub;
use slotbook::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use slotbook::reconciler::run_reconciler;
use slotbook::store::{run_compactor, DurableStore, InMemoryStore, RedisStore, ReservationStore};
use slotbook::wire;

async fn open_store(config: &Config) -> Result<Arc<dyn ReservationStore>, Box<dyn std::error::Error>> {
    let store: Arc<dyn ReservationStore> = match config.store {
        StoreKind::Durable => {
            std::fs::create_dir_all(&config.data_dir)?;
            let store = Arc::new(DurableStore::open(&config.wal_path())?);
            tokio::spawn(run_compactor(store.clone(), config.compact_threshold));
            store
        }
        StoreKind::Memory => Arc::new(InMemoryStore::new()),
        StoreKind::Redis => Arc::new(RedisStore::connect(&config.redis_url, "slotbook").await?),
    };
    Ok(store)
}

/// Log every booking event. Stands in for an outbound messaging integration.
async fn relay_events(notify: Arc<NotifyHub>) {
    let mut events = notify.subscribe_all();
    loop {
        match events.recv().await {
            Ok(BookingEvent::Confirmed(r)) => {
                info!(target: "slotbook::events", "confirmed {} {} {} for {}", r.resource_id, r.date, r.time_slot, r.owner_id)
            }
            Ok(BookingEvent::Cancelled(r)) => {
                info!(target: "slotbook::events", "cancelled {} {} {} for {}", r.resource_id, r.date, r.time_slot, r.owner_id)
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("event relay lagged, {n} events dropped")
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    slotbook::observability::init(config.metrics_port)?;

    let tls_acceptor = slotbook::tls::load_tls_acceptor(&config)?;

    let store = open_store(&config).await?;
    let notify = Arc::new(NotifyHub::new());
    let service = Arc::new(ReservationService::new(store, notify.clone()));

    // A shared Redis may have other instances mid-create; local stores have
    // nothing in flight before the listener opens.
    let startup_age = match config.store {
        StoreKind::Redis => Duration::from_millis(ORPHAN_MIN_AGE_MS),
        StoreKind::Durable | StoreKind::Memory => Duration::ZERO,
    };
    match service.reconciler().sweep_orphans(startup_age).await {
        Ok(0) => {}
        Ok(n) => info!("startup sweep queued {n} orphaned slot claims"),
        Err(e) => tracing::warn!("startup orphan sweep failed: {e}"),
    }
    tokio::spawn(run_reconciler(service.reconciler(), config.reconcile_interval));
    tokio::spawn(relay_events(notify));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotbook listening on {addr}");
    info!("  store: {:?}", config.store);
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let service = service.clone();
                let password = config.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, service, password, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("slotbook stopped");
    Ok(())
}
