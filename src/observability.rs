use std::net::SocketAddr;

use crate::model::ConflictType;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: slot queries executed. Labels: status.
pub const SLOT_QUERIES_TOTAL: &str = "slotwise_slot_queries_total";

/// Histogram: slot query latency in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "slotwise_slot_query_duration_seconds";

/// Counter: staff skipped during slot generation because their schedule lookup failed.
pub const STAFF_SKIPPED_TOTAL: &str = "slotwise_staff_skipped_total";

/// Counter: appointments committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotwise_bookings_created_total";

/// Counter: appointment writes aborted by the insert-time re-check.
pub const BOOKINGS_REJECTED_TOTAL: &str = "slotwise_bookings_rejected_total";

// ── Conflict pipeline ───────────────────────────────────────────

/// Counter: conflicts recorded. Labels: kind.
pub const CONFLICTS_DETECTED_TOTAL: &str = "slotwise_conflicts_detected_total";

/// Counter: conflict records that failed to persist.
pub const CONFLICT_PERSIST_FAILURES_TOTAL: &str = "slotwise_conflict_persist_failures_total";

/// Counter: strategy executions. Labels: strategy, outcome.
pub const RESOLUTIONS_TOTAL: &str = "slotwise_resolutions_total";

/// Counter: conflicts handed to manual review.
pub const ESCALATIONS_TOTAL: &str = "slotwise_escalations_total";

/// Counter: notifications handed to the dispatcher.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "slotwise_notifications_sent_total";

/// Counter: expired waitlist entries removed by the reaper.
pub const WAITLIST_REAPED_TOTAL: &str = "slotwise_waitlist_reaped_total";

/// Counter: store calls retried after a transient failure.
pub const STORE_RETRIES_TOTAL: &str = "slotwise_store_retries_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        tracing::error!("failed to install Prometheus metrics exporter: {e}");
        return;
    }
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a conflict type to a short label for metrics.
pub fn conflict_label(kind: ConflictType) -> &'static str {
    match kind {
        ConflictType::DoubleBooking => "double_booking",
        ConflictType::Overlapping => "overlapping",
        ConflictType::StaffUnavailable => "staff_unavailable",
        ConflictType::BranchClosed => "branch_closed",
    }
}
