use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fieldtime_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fieldtime_query_duration_seconds";

/// Counter: business rejections. Labels: op, reason.
pub const REJECTIONS_TOTAL: &str = "fieldtime_rejections_total";

/// Counter: attempts repeated after a lock timeout. Labels: op.
pub const LOCK_RETRIES_TOTAL: &str = "fieldtime_lock_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fieldtime_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fieldtime_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fieldtime_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fieldtime_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fieldtime_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "fieldtime_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertReservation(_) => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations(_) => "select_reservations",
        Command::SelectOccupiedHours { .. } => "select_occupied_hours",
        Command::SelectFreeIntervals { .. } => "select_free_intervals",
        Command::SelectResources => "select_resources",
        Command::InsertParticipant { .. } => "insert_participant",
        Command::DeleteParticipant { .. } => "delete_participant",
    }
}
