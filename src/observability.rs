use std::net::SocketAddr;

use crate::model::{IncidentSeverity, ReservationStatus};

// ── Booking flow ────────────────────────────────────────────────

/// Counter: reservations persisted. Labels: mode (single, batch).
pub const RESERVATIONS_CREATED_TOTAL: &str = "labres_reservations_created_total";

/// Counter: create attempts rejected because the device or supply was taken.
pub const CONFLICTS_TOTAL: &str = "labres_conflicts_total";

/// Counter: status transitions committed. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "labres_transitions_total";

/// Counter: devices forced into maintenance by low ratings.
pub const MAINTENANCE_FLAGGED_TOTAL: &str = "labres_maintenance_flagged_total";

/// Counter: incidents reported. Labels: severity.
pub const INCIDENTS_REPORTED_TOTAL: &str = "labres_incidents_reported_total";

/// Counter: incidents resolved.
pub const INCIDENTS_RESOLVED_TOTAL: &str = "labres_incidents_resolved_total";

// ── Reconciler ──────────────────────────────────────────────────

/// Counter: reservations marked overdue by the sweep.
pub const OVERDUE_MARKED_TOTAL: &str = "labres_overdue_marked_total";

/// Counter: per-record sweep failures.
pub const SWEEP_FAILURES_TOTAL: &str = "labres_sweep_failures_total";

/// Histogram: sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "labres_sweep_duration_seconds";

// ── Notifications ───────────────────────────────────────────────

pub const NOTIFICATIONS_SENT_TOTAL: &str = "labres_notifications_sent_total";
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "labres_notifications_failed_total";
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "labres_notifications_dropped_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labres_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "labres_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a target status.
pub fn status_label(status: ReservationStatus) -> &'static str {
    match status {
        ReservationStatus::Pending => "pending",
        ReservationStatus::Approved => "approved",
        ReservationStatus::Active => "active",
        ReservationStatus::Completed => "completed",
        ReservationStatus::Rejected => "rejected",
        ReservationStatus::Cancelled => "cancelled",
        ReservationStatus::Overdue => "overdue",
    }
}

pub fn severity_label(severity: IncidentSeverity) -> &'static str {
    match severity {
        IncidentSeverity::Low => "low",
        IncidentSeverity::Medium => "medium",
        IncidentSeverity::High => "high",
    }
}
