use crate::{
    engine::{Engine, worker::{WORKER_TICK, retry::RetryJob}},
    persistence::DailySnapshot,
};
use chrono::{DateTime, Days, TimeDelta, Utc};
use propel_execution::event::{TradeEvent, TradeEventKind};
use serde_json::json;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// The next 00:00 UTC strictly after `now`.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

/// Run the daily reset sweep once a minute.
pub async fn run_daily_reset_worker(
    engine: Arc<Engine>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(WORKER_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => engine.run_daily_resets().await,
            _ = shutdown.changed() => return,
        }
    }
}

impl Engine {
    /// Roll every due account over its UTC boundary: write the end-of-day snapshot, reset
    /// daily counters, and advance the trading-day count iff there was activity.
    pub async fn run_daily_resets(&self) {
        let now = Utc::now();

        for account_id in self.accounts.ids() {
            let Some(mut account) = self.accounts.lock(account_id).await else {
                continue;
            };
            if account.daily_reset_at > now || !account.status.can_trade() {
                continue;
            }

            let completed_day = (account.daily_reset_at - TimeDelta::days(1)).date_naive();
            let snapshot = DailySnapshot {
                account_id,
                snapshot_date: completed_day,
                starting_balance: account.daily_starting_balance,
                ending_balance: account.current_balance,
                peak_balance: account.peak_balance,
                daily_pnl: account.daily_pnl,
                drawdown: account.peak_balance - account.current_balance,
                trades_closed: account.daily_trades,
                volume: account.daily_volume,
            };

            let event = TradeEvent::new(
                account_id,
                TradeEventKind::DailyReset,
                None,
                None,
                json!({
                    "snapshot_date": completed_day.to_string(),
                    "ending_balance": account.current_balance.to_string(),
                    "daily_pnl": account.daily_pnl.to_string(),
                    "trading_days": account.trading_days,
                }),
                now,
            );

            account.reset_daily(next_utc_midnight(now));

            // Snapshot insert is idempotent on (account, date); all three writes are
            // deferred through the retry queue so a store blip cannot stall the sweep
            self.enqueue_retry(RetryJob::InsertSnapshot(snapshot));
            self.record_event(event);
            self.enqueue_retry(RetryJob::UpdateAccount(Box::new(account.clone())));
            self.accounts.mark_dirty(account_id);

            info!(
                account = %account_id,
                trading_days = account.trading_days,
                "daily reset applied"
            );
        }
    }
}
