//! Scheduled housekeeping.
//!
//! Refresh tokens are kept forever for reuse detection, and dead-lettered
//! events stay until someone looks at them; only acknowledged rename events
//! are purged.

use crate::db::Database;
use std::time::Duration;
use tracing::{error, info};

/// How long acknowledged rename events are kept.
pub const DONE_EVENT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Interval between cleanup runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60); // 1 hour

/// Run all cleanup tasks once.
pub async fn run_cleanup(db: &Database) {
    match db.rename_queue().purge_done(DONE_EVENT_RETENTION).await {
        Ok(count) if count > 0 => info!("Cleaned up {} acknowledged rename events", count),
        Ok(_) => {}
        Err(e) => error!("Failed to clean up rename events: {}", e),
    }
}

/// Spawn a background task that runs cleanup periodically.
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_scheduler(db: Database) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            interval.tick().await;
            run_cleanup(&db).await;
        }
    })
}
