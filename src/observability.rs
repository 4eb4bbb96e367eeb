use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "cineseat_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "cineseat_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "cineseat_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "cineseat_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "cineseat_connections_rejected_total";

/// Counter: statements refused because the login name is not a user id.
pub const AUTH_FAILURES_TOTAL: &str = "cineseat_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "cineseat_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "cineseat_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "cineseat_wal_compactions_total";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: tickets committed.
pub const TICKETS_ISSUED_TOTAL: &str = "cineseat_tickets_issued_total";

/// Counter: ticket requests refused. Labels: reason (owner, sold_out).
pub const TICKETS_REJECTED_TOTAL: &str = "cineseat_tickets_rejected_total";

/// Counter: session creations refused for overlapping the hall schedule.
pub const SESSIONS_REJECTED_TOTAL: &str = "cineseat_sessions_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertHall { .. } => "insert_hall",
        Command::InsertMovie { .. } => "insert_movie",
        Command::InsertSession { .. } => "insert_session",
        Command::InsertTicket { .. } => "insert_ticket",
        Command::DeleteHall { .. } => "delete_hall",
        Command::DeleteMovie { .. } => "delete_movie",
        Command::DeleteSession { .. } => "delete_session",
        Command::DeleteTicket { .. } => "delete_ticket",
        Command::SelectHalls { .. } => "select_halls",
        Command::SelectMovies { .. } => "select_movies",
        Command::SelectSessions { .. } => "select_sessions",
        Command::SelectTickets { .. } => "select_tickets",
    }
}
