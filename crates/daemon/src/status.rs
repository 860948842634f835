//! Periodic partition status logging.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use virtdir_core::PartitionManager;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Log every partition's status once a minute until aborted.
pub async fn run(manager: Arc<PartitionManager>) {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    // The first tick fires immediately; skip it so startup logs stay clean.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for name in manager.partition_names() {
            if let Ok(status) = manager.status(&name) {
                info!(partition = %name, status = %status, "partition status");
            }
        }
    }
}
