use crate::engine::Engine;
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;

/// Daily UTC reset worker.
pub mod daily_reset;

/// Dirty-account write-behind flusher.
pub mod flusher;

/// 8-hour funding application worker.
pub mod funding;

/// Persistence retry queue with exponential backoff.
pub mod retry;

/// Cadence of the periodic workers (daily reset, funding, expiry sweep).
pub const WORKER_TICK: Duration = Duration::from_secs(60);

/// Sweep expired pending limit orders once a minute, releasing their reservations.
pub async fn run_expiry_worker(engine: Arc<Engine>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(WORKER_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => engine.sweep_expired_orders().await,
            _ = shutdown.changed() => return,
        }
    }
}
