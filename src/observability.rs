use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "stayledger_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "stayledger_query_duration_seconds";

// ── Ledger metrics ──────────────────────────────────────────────

/// Counter: stays committed by `book_stay`.
pub const STAYS_BOOKED_TOTAL: &str = "stayledger_stays_booked_total";

/// Counter: committed stay transitions. Labels: transition.
pub const STAY_TRANSITIONS_TOTAL: &str = "stayledger_stay_transitions_total";

/// Counter: payout attempts. Labels: status (settled, failed).
pub const PAYOUTS_TOTAL: &str = "stayledger_payouts_total";

/// Counter: bookings and modifications turned away. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "stayledger_booking_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "stayledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "stayledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stayledger_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "stayledger_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "stayledger_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stayledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stayledger_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "stayledger_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertFacility { .. } => "insert_facility",
        Command::UpdateFacility { .. } => "update_facility",
        Command::DeleteFacility { .. } => "delete_facility",
        Command::InsertSpace { .. } => "insert_space",
        Command::UpdateSpace { .. } => "update_space",
        Command::DeleteSpace { .. } => "delete_space",
        Command::InsertStay { .. } => "insert_stay",
        Command::ModifyStay { .. } => "modify_stay",
        Command::CheckIn { .. } => "check_in",
        Command::CheckOut { .. } => "check_out",
        Command::CancelStay { .. } => "cancel_stay",
        Command::SelectFacilities { .. } => "select_facilities",
        Command::SelectSpaces { .. } => "select_spaces",
        Command::SelectStays { .. } => "select_stays",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
