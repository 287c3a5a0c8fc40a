use std::net::SocketAddr;

use crate::sql::Command;

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: reservations confirmed.
pub const RESERVATIONS_CREATED_TOTAL: &str = "slotbook_reservations_created_total";

/// Counter: create calls that lost the slot to an existing holder.
pub const RESERVATIONS_CONFLICTED_TOTAL: &str = "slotbook_reservations_conflicted_total";

/// Counter: reservations cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "slotbook_reservations_cancelled_total";

/// Counter: create calls rejected by validation.
pub const VALIDATION_FAILURES_TOTAL: &str = "slotbook_validation_failures_total";

/// Counter: store calls that failed. Labels: op.
pub const STORE_ERRORS_TOTAL: &str = "slotbook_store_errors_total";

/// Gauge: slot-index repairs waiting for the reconciler. Non-zero means a
/// slot may be unbookable until the store recovers.
pub const RECONCILE_PENDING: &str = "slotbook_reconcile_pending";

// ── Request layer ───────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

// ── Durable store ───────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is `None`.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::DeleteReservation { .. } => "delete_reservation",
    }
}
