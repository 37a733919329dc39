use std::net::SocketAddr;

// ── Admission ───────────────────────────────────────────────────

/// Counter: bookings admitted. Labels: facility.
pub const BOOKINGS_ADMITTED_TOTAL: &str = "courtbook_bookings_admitted_total";

/// Counter: admissions rejected. Labels: reason (`BookingError::kind`).
pub const BOOKINGS_REJECTED_TOTAL: &str = "courtbook_bookings_rejected_total";

/// Histogram: end-to-end admission latency in seconds.
pub const ADMISSION_DURATION_SECONDS: &str = "courtbook_admission_duration_seconds";

/// Counter: occupancy compare-and-swap attempts that lost a race.
pub const OCCUPANCY_CAS_RETRIES_TOTAL: &str = "courtbook_occupancy_cas_retries_total";

/// Counter: seats released because the booking insert failed after the increment.
pub const COMPENSATIONS_TOTAL: &str = "courtbook_compensations_total";

/// Counter: status transitions applied. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "courtbook_status_transitions_total";

// ── Lifecycle ───────────────────────────────────────────────────

/// Counter: lifecycle runs. Labels: outcome (ok, partial, aborted).
pub const LIFECYCLE_RUNS_TOTAL: &str = "courtbook_lifecycle_runs_total";

/// Counter: bookings moved to history.
pub const LIFECYCLE_ARCHIVED_TOTAL: &str = "courtbook_lifecycle_archived_total";

/// Counter: slots reset. Labels: facility.
pub const SLOTS_RESET_TOTAL: &str = "courtbook_slots_reset_total";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
