use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "duet_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "duet_query_duration_seconds";

/// Counter: book/reschedule attempts refused. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "duet_booking_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "duet_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "duet_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "duet_connections_rejected_total";

/// Counter: lock waits that ran past the configured timeout. Labels: lock.
pub const LOCK_TIMEOUTS_TOTAL: &str = "duet_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "duet_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "duet_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "duet_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on port {port}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPerson { .. } => "insert_person",
        Command::DeletePerson { .. } => "delete_person",
        Command::SelectPerson { .. } => "select_person",
        Command::SetAvailability { .. } => "set_availability",
        Command::ClearAvailability { .. } => "clear_availability",
        Command::SelectAvailability { .. } => "select_availability",
        Command::BookAppointment { .. } => "book",
        Command::CancelAppointment { .. } => "cancel",
        Command::RescheduleAppointment { .. } => "reschedule",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAppointment { .. } => "select_appointment",
    }
}
