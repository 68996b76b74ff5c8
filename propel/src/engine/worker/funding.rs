use crate::engine::{Engine, worker::WORKER_TICK};
use chrono::{DateTime, TimeDelta, Timelike, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use propel_execution::{AccountId, Side, event::{TradeEvent, TradeEventKind}, position::Position};
use rust_decimal::Decimal;
use serde_json::json;
use smol_str::SmolStr;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Grace window after a funding boundary during which application is attempted.
pub fn funding_grace() -> TimeDelta {
    TimeDelta::minutes(5)
}

/// Per-symbol funding rates with a configured default, refreshable at runtime.
#[derive(Debug)]
pub struct FundingRates {
    default_rate: Decimal,
    rates: RwLock<FnvHashMap<SmolStr, Decimal>>,
}

impl FundingRates {
    pub fn new(default_rate: Decimal) -> Self {
        Self {
            default_rate,
            rates: RwLock::new(FnvHashMap::default()),
        }
    }

    /// Funding rate per 8h interval for the symbol.
    pub fn rate(&self, symbol: &str) -> Decimal {
        self.rates
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(self.default_rate)
    }

    pub fn set_rate(&self, symbol: &str, rate: Decimal) {
        self.rates.write().insert(SmolStr::new(symbol), rate);
    }
}

/// The most recent funding boundary (00:00 / 08:00 / 16:00 UTC) at or before `now`.
pub fn current_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let boundary_hour = (now.hour() / 8) * 8;
    now.date_naive()
        .and_hms_opt(boundary_hour, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

/// Run the funding sweep once a minute; it only acts inside the grace window after a
/// boundary, and per-position idempotence makes repeated passes no-ops.
pub async fn run_funding_worker(
    engine: Arc<Engine>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(WORKER_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                let boundary = current_boundary(now);
                if now.signed_duration_since(boundary) <= funding_grace() {
                    engine.apply_funding_boundary(boundary).await;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

impl Engine {
    /// Apply the funding boundary to every open position that held through it.
    ///
    /// LONG positions pay `notional · rate`, SHORT positions receive it. Idempotent by
    /// each position's `last_funding_at`: re-applying the same boundary is a no-op.
    pub async fn apply_funding_boundary(&self, boundary: DateTime<Utc>) {
        let mut by_account: FnvHashMap<AccountId, Vec<Position>> = FnvHashMap::default();
        for position in self.positions.all() {
            by_account
                .entry(position.account_id)
                .or_default()
                .push(position);
        }

        for (account_id, positions) in by_account {
            let Some(mut account) = self.accounts.lock(account_id).await else {
                continue;
            };

            let mut total_cost = Decimal::ZERO;
            let mut updated = Vec::new();

            for position in positions {
                // Re-resolve under the account lock; a close may have raced the sweep
                let Some(mut position) = self.positions.get(position.id) else {
                    continue;
                };
                if position.opened_at > boundary {
                    continue;
                }
                if position
                    .last_funding_at
                    .is_some_and(|last| last >= boundary)
                {
                    continue;
                }

                let rate = self.funding_rates.rate(&position.symbol);
                let payment = position.entry_value * rate;
                let cost = match position.side {
                    Side::Long => payment,
                    Side::Short => -payment,
                };

                position.accumulated_funding += cost;
                position.last_funding_at = Some(boundary);
                total_cost += cost;
                updated.push(position);
            }

            if updated.is_empty() {
                continue;
            }

            // Persist the position rows first; the account follows through the dirty
            // flusher. A failure leaves last_funding_at untouched so the next minute's
            // pass (inside the grace window) retries.
            let mut persisted = Vec::with_capacity(updated.len());
            let mut failed = false;
            for position in &updated {
                if let Err(persist_error) = self.repository.update_position(position).await {
                    warn!(
                        position = %position.id,
                        ?persist_error,
                        "funding position update failed - boundary will retry"
                    );
                    failed = true;
                    break;
                }
                persisted.push(position.clone());
            }
            if failed {
                // Roll the already-persisted rows back to their pre-funding state
                for position in persisted {
                    if let Some(original) = self.positions.get(position.id) {
                        let _ = self.repository.update_position(&original).await;
                    }
                }
                continue;
            }

            account.apply_funding(total_cost);
            for position in updated {
                self.positions.update(position);
            }
            self.accounts.mark_dirty(account_id);

            self.record_event(TradeEvent::new(
                account_id,
                TradeEventKind::FundingApplied,
                None,
                None,
                json!({
                    "boundary": boundary.to_rfc3339(),
                    "cost": total_cost.to_string(),
                }),
                Utc::now(),
            ));
            self.emit_account_update(&account);
            self.enforce_risk_locked(&mut account).await;

            info!(
                account = %account_id,
                %total_cost,
                boundary = %boundary,
                "funding applied"
            );
        }
    }
}
