use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::ledger::BillingLedger;
use crate::store::Store;
use crate::validate::now_ms;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that periodically flips Pending charges past their due
/// date to Overdue.
pub async fn run_overdue_sweeper(ledger: Arc<BillingLedger>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match ledger.mark_overdue(now_ms()).await {
            Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "overdue sweep"),
            Ok(_) => debug!("overdue sweep: nothing due"),
            // Retried on the next tick.
            Err(e) => warn!(error = %e, "overdue sweep failed"),
        }
    }
}

/// Compact the WAL if more than `threshold` frames were appended since the
/// last compaction. Returns whether it compacted.
pub async fn compact_if_needed(store: &Store, threshold: u64) -> Result<bool, EngineError> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    store.compact().await?;
    info!(appends, "compacted WAL");
    Ok(true)
}

/// Background task that keeps the WAL short and drops notification channels
/// nobody listens to.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        store.notify.prune();
        if let Err(e) = compact_if_needed(&store, threshold).await {
            warn!(error = %e, "WAL compaction failed");
        }
    }
}
