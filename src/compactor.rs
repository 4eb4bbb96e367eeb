use std::time::Duration;

use tracing::{error, info};

use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::{MemoryStore, StoreError};

pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL as a snapshot once `threshold`
/// transactions have been appended since the last compaction.
pub async fn run_compactor(store: MemoryStore, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match compact_if_due(&store, threshold).await {
            Ok(_) => {}
            Err(StoreError::Closed) => break,
            Err(e) => error!("compaction failed: {e}"),
        }
    }
}

/// Compact when due. Returns whether a compaction ran.
pub async fn compact_if_due(store: &MemoryStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await?;
    if appends < threshold {
        return Ok(false);
    }
    store.compact().await?;
    metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted WAL after {appends} appends");
    Ok(true)
}
