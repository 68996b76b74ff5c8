use crate::engine::{Engine, worker::retry::RetryJob};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Write-behind flusher for dirty accounts.
///
/// Flushes at the configured interval, or immediately once the dirty set exceeds the
/// configured queue depth, coalescing repeated mutations of one account into one write.
/// The final flush on shutdown runs before the process exits.
pub async fn run_account_flusher(
    engine: Arc<Engine>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(engine.config.account_flush_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => flush_dirty(&engine).await,
            _ = engine.accounts.dirty_notified() => {
                if engine.accounts.dirty_len() >= engine.config.account_flush_queue_depth {
                    flush_dirty(&engine).await;
                }
            }
            _ = shutdown.changed() => {
                flush_dirty(&engine).await;
                info!("account flusher drained on shutdown");
                return;
            }
        }
    }
}

async fn flush_dirty(engine: &Engine) {
    let dirty = engine.accounts.take_dirty();
    if dirty.is_empty() {
        return;
    }

    let count = dirty.len();
    for account_id in dirty {
        let Some(snapshot) = engine.accounts.snapshot(account_id).await else {
            continue;
        };
        if let Err(persist_error) = engine.repository.update_account(&snapshot).await {
            debug!(
                account = %account_id,
                ?persist_error,
                "account flush failed - handing to retry queue"
            );
            engine.enqueue_retry(RetryJob::UpdateAccount(Box::new(snapshot)));
        }
    }
    debug!(count, "dirty accounts flushed");
}
