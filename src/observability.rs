use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwise_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwise_query_duration_seconds";

// ── Lifecycle metrics ───────────────────────────────────────────

/// Counter: claim attempts. Labels: outcome (ok, conflict, not_found, error).
pub const CLAIMS_TOTAL: &str = "slotwise_claims_total";

/// Counter: cancellation attempts. Labels: role, outcome.
pub const CANCELLATIONS_TOTAL: &str = "slotwise_cancellations_total";

/// Counter: OPEN slots created.
pub const SLOTS_PUBLISHED_TOTAL: &str = "slotwise_slots_published_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";
/// Counter: connections rejected due to the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "slotwise_tenants_active";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";
/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Install the Prometheus exporter on `bind:port`. No-op if port is None.
pub fn init(bind: &str, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterService { .. } => "register_service",
        Command::PublishSlots { .. } => "publish_slots",
        Command::Claim { .. } => "claim",
        Command::Cancel { .. } => "cancel",
        Command::SelectServices => "select_services",
        Command::SelectOpenSlots { .. } => "select_open_slots",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectMyAppointments { .. } => "select_my_appointments",
        Command::Listen { .. } => "listen",
    }
}
