use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reserve calls. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "classbook_reservations_total";

/// Counter: cancel calls. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "classbook_cancellations_total";

/// Histogram: reserve latency in seconds, retries included.
pub const RESERVE_DURATION_SECONDS: &str = "classbook_reserve_duration_seconds";

/// Counter: personal session bookings. Labels: outcome.
pub const PERSONAL_BOOKINGS_TOTAL: &str = "classbook_personal_bookings_total";

/// Counter: ledger status transitions. Labels: status.
pub const LEDGER_ENTRIES_TOTAL: &str = "classbook_ledger_entries_total";

/// Counter: billing sub-steps that failed after the booking itself committed. Labels: step.
pub const BILLING_PARTIAL_FAILURES_TOTAL: &str = "classbook_billing_partial_failures_total";

// ── USE metrics (store utilization) ─────────────────────────────

/// Counter: transaction retries after a transient failure. Labels: op.
pub const TRANSACTION_RETRIES_TOTAL: &str = "classbook_transaction_retries_total";

/// Counter: transactions that exhausted their retries. Labels: op.
pub const TRANSACTION_EXHAUSTED_TOTAL: &str = "classbook_transaction_exhausted_total";

/// Counter: row lock waits that hit the timeout. Labels: row.
pub const LOCK_TIMEOUTS_TOTAL: &str = "classbook_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "classbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (frames per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "classbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
