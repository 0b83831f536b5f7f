use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DocumentStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically rewrite the WAL once it has grown past `threshold` appends.
pub async fn run_compactor(store: Arc<DocumentStore>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            debug!("compactor: {appends} appends since last compaction");
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
