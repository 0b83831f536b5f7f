use std::net::SocketAddr;

use crate::protocol::ClientOp;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "clinicd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "clinicd_request_duration_seconds";

/// Counter: bookings and reschedules refused by the conflict guard.
pub const BOOKING_CONFLICTS_TOTAL: &str = "clinicd_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open connections.
pub const CONNECTIONS_ACTIVE: &str = "clinicd_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "clinicd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "clinicd_connections_rejected_total";

/// Counter: rejected identity tokens.
pub const AUTH_FAILURES_TOTAL: &str = "clinicd_auth_failures_total";

/// Counter: room joins refused.
pub const FORBIDDEN_JOINS_TOTAL: &str = "clinicd_forbidden_joins_total";

// ── Propagation ─────────────────────────────────────────────────

/// Counter: change events routed to rooms. Labels: kind.
pub const EVENTS_FORWARDED_TOTAL: &str = "clinicd_events_forwarded_total";

/// Counter: watch loop resubscriptions. Labels: kind.
pub const WATCH_RESTARTS_TOTAL: &str = "clinicd_watch_restarts_total";

/// Counter: pushes dropped because a connection's outbox was full.
pub const PUSHES_DROPPED_TOTAL: &str = "clinicd_pushes_dropped_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "clinicd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "clinicd_wal_flush_batch_size";

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

/// Short metrics label for a client operation.
pub fn op_label(op: &ClientOp) -> &'static str {
    match op {
        ClientOp::Auth { .. } => "auth",
        ClientOp::Slots { .. } => "slots",
        ClientOp::CreateAppointment(_) => "create_appointment",
        ClientOp::UpdateStatus { .. } => "update_status",
        ClientOp::Reschedule { .. } => "reschedule",
        ClientOp::GetAppointment { .. } => "get_appointment",
        ClientOp::PutDocument { .. } => "put_document",
        ClientOp::DeleteDocument { .. } => "delete_document",
        ClientOp::JoinTenant { .. } => "join_tenant",
        ClientOp::JoinPrivileged => "join_privileged",
        ClientOp::Ping => "ping",
    }
}
