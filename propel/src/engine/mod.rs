use crate::{
    cache::{SharedCache, rate_limit::RateLimiter},
    config::EngineConfig,
    engine::{
        account::AccountManager,
        pending::PendingOrderBook,
        position_manager::PositionManager,
        price::{PriceEngine, TickOutcome},
        trigger::TriggerEngine,
        worker::{funding::FundingRates, retry::RetryJob},
    },
    error::EngineError,
    persistence::Repository,
    server::{message::ServerMessage, registry::SessionRegistry},
};
use chrono::Utc;
use fnv::FnvHashSet;
use propel_data::BookTickerUpdate;
use propel_execution::{AccountId, PositionId, event::TradeEvent, position::Position};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Authoritative in-memory account state and the per-account locking discipline.
pub mod account;

/// Synchronous order / close executors.
pub mod executor;

/// Pending (unfilled) limit-order book.
pub mod pending;

/// Open-position store with account/symbol indexes.
pub mod position_manager;

/// Quote derivation, staleness and circuit breaking.
pub mod price;

/// Continuous risk and evaluation-progression checks.
pub mod risk;

/// Per-symbol sorted TP/SL/liquidation indexes.
pub mod trigger;

/// Long-lived periodic workers.
pub mod worker;

/// Liquidation warning threshold: warn once the mark has covered 80% of the distance from
/// entry to the liquidation price (ie/ 20% of the distance remains).
fn liq_warning_remaining_fraction() -> Decimal {
    Decimal::new(2, 1)
}

/// The real-time execution core, owning every engine component.
///
/// Constructed once at startup and shared (`Arc`) between the feed ingress task, client
/// sessions and the periodic workers. No process-global mutable state exists; everything
/// reachable hangs off this value.
pub struct Engine {
    pub config: EngineConfig,
    pub prices: PriceEngine,
    pub accounts: AccountManager,
    pub positions: PositionManager,
    pub pending: PendingOrderBook,
    pub triggers: TriggerEngine,
    pub sessions: SessionRegistry,
    pub limiter: RateLimiter,
    pub funding_rates: FundingRates,
    pub repository: Arc<dyn Repository>,
    pub cache: Arc<dyn SharedCache>,

    retry_tx: tokio::sync::mpsc::UnboundedSender<RetryJob>,
    retry_rx: parking_lot::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<RetryJob>>>,
    /// Positions already warned about liquidation proximity; cleared on close.
    warned: parking_lot::Mutex<FnvHashSet<PositionId>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("symbols", &self.config.symbols)
            .field("open_positions", &self.positions.len())
            .finish()
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        let prices = PriceEngine::new(
            config
                .symbols
                .iter()
                .map(|symbol| (symbol.clone(), config.spread_bps(symbol))),
            config.circuit_breaker_threshold_pct,
            config.circuit_breaker_reset,
            config.price_stale_threshold,
        );
        let funding_rates = FundingRates::new(config.default_funding_rate);
        let limiter = RateLimiter::new(Arc::clone(&cache));
        let (retry_tx, retry_rx) = tokio::sync::mpsc::unbounded_channel();

        Self {
            config,
            prices,
            accounts: AccountManager::new(),
            positions: PositionManager::new(),
            pending: PendingOrderBook::new(),
            triggers: TriggerEngine::new(),
            sessions: SessionRegistry::new(),
            limiter,
            funding_rates,
            repository,
            cache,
            retry_tx,
            retry_rx: parking_lot::Mutex::new(Some(retry_rx)),
            warned: parking_lot::Mutex::new(FnvHashSet::default()),
        }
    }

    /// Load every relevant account and open position from the store of record, rebuilding
    /// the in-memory indexes and trigger entries.
    pub async fn load_state(&self) -> Result<(), EngineError> {
        let accounts = self.repository.load_accounts().await?;
        let account_count = accounts.len();
        for account in accounts {
            self.accounts.insert(account);
        }

        let positions = self.repository.load_open_positions().await?;
        let position_count = positions.len();
        for position in positions {
            if !self.accounts.contains(position.account_id) {
                warn!(
                    position = %position.id,
                    account = %position.account_id,
                    "open position for unloaded account - skipping"
                );
                continue;
            }
            self.triggers.register(&position);
            self.positions.add(position);
        }

        info!(account_count, position_count, "engine state loaded");
        Ok(())
    }

    /// Process one upstream book-ticker update end-to-end: derive the quote, re-mark
    /// positions, fan out to subscribers, fire triggers, and fill crossed limit orders.
    ///
    /// Triggers fired by this tick settle before the method returns, so they are always
    /// processed before the next tick is accepted.
    pub async fn process_tick(&self, update: BookTickerUpdate) {
        let outcome = self
            .prices
            .update(&update.symbol, update.bid, update.ask, Utc::now());

        let tick = match outcome {
            TickOutcome::Accepted(tick) => tick,
            TickOutcome::RejectedCircuitOpen => {
                debug!(symbol = %update.symbol, "tick rejected: circuit open");
                return;
            }
            TickOutcome::RejectedUnknownSymbol => return,
        };

        // External price snapshot is best-effort and must never block the tick path
        let cache = Arc::clone(&self.cache);
        let snapshot_tick = tick.clone();
        tokio::spawn(async move {
            if let Err(error) = cache.publish_price(&snapshot_tick).await {
                debug!(?error, "price snapshot publish failed");
            }
        });

        let marked = self.positions.update_price_for_symbol(&tick);
        self.sessions.broadcast_symbol(
            &tick.symbol,
            &ServerMessage::PriceTick { tick: tick.clone() },
        );

        self.check_liquidation_warnings(&marked);

        for fired in self.triggers.fired(&tick) {
            if let Err(error) = self.close_from_trigger(&fired, &tick).await {
                // Entry stays registered and re-fires on the next tick
                warn!(
                    position = %fired.entry.position_id,
                    reason = ?fired.reason,
                    ?error,
                    "trigger close failed - will re-fire"
                );
            }
        }

        for order in self.pending.crossed(&tick) {
            if let Err(error) = self.fill_pending_order(order, &tick).await {
                warn!(?error, "pending order fill failed");
            }
        }
    }

    /// Fan a depth snapshot out to subscribed sessions. Display only; depth never
    /// participates in fill pricing.
    pub fn process_depth(&self, update: propel_data::DepthUpdate) {
        let symbol = update.symbol.clone();
        self.sessions
            .broadcast_symbol(&symbol, &ServerMessage::DepthSnapshot { depth: update });
    }

    /// Queue a deferred write for the persistence retry worker.
    pub fn enqueue_retry(&self, job: RetryJob) {
        if self.retry_tx.send(job).is_err() {
            error!("persistence retry queue receiver dropped");
        }
    }

    /// Route an audit event through the retry-safe writer.
    pub fn record_event(&self, event: TradeEvent) {
        self.enqueue_retry(RetryJob::AppendEvent(event));
    }

    /// Take the retry-queue receiver. Callable once, by the system wiring.
    pub fn take_retry_rx(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<RetryJob>> {
        self.retry_rx.lock().take()
    }

    /// Emit an `ACCOUNT_UPDATED` snapshot to the account's sessions and the shared-cache
    /// fan-out channel.
    pub fn emit_account_update(&self, account: &account::Account) {
        let summary = account::AccountSummary::from(account);
        let message = ServerMessage::AccountUpdated {
            account: summary.clone(),
        };
        self.sessions.send_to_account(account.id, &message);

        let cache = Arc::clone(&self.cache);
        let account_id = account.id;
        tokio::spawn(async move {
            if let Ok(payload) = serde_json::to_string(&summary) {
                if let Err(error) = cache.publish_account_event(account_id, &payload).await {
                    debug!(?error, "account event publish failed");
                }
            }
        });
    }

    /// Forget liquidation-warning state for a closed position.
    pub(crate) fn clear_liquidation_warning(&self, position_id: PositionId) {
        self.warned.lock().remove(&position_id);
    }

    /// Warn each account once when a position's mark covers 80% of the distance from entry
    /// to its liquidation price.
    fn check_liquidation_warnings(&self, marked: &[(PositionId, AccountId)]) {
        for (position_id, account_id) in marked {
            let Some(position) = self.positions.get(*position_id) else {
                continue;
            };
            if !liquidation_imminent(&position) {
                continue;
            }
            if !self.warned.lock().insert(*position_id) {
                continue;
            }

            self.sessions.send_to_account(
                *account_id,
                &ServerMessage::LiquidationWarning {
                    position_id: *position_id,
                    liquidation_price: position.liquidation_price,
                    current_price: position.current_price,
                },
            );
            self.record_event(TradeEvent::new(
                *account_id,
                propel_execution::event::TradeEventKind::LiquidationWarning,
                Some(*position_id),
                None,
                serde_json::json!({
                    "symbol": position.symbol.as_str(),
                    "current_price": position.current_price.to_string(),
                    "liquidation_price": position.liquidation_price.to_string(),
                }),
                Utc::now(),
            ));
        }
    }
}

/// Whether the mark price has covered 80% of the entry→liquidation distance.
fn liquidation_imminent(position: &Position) -> bool {
    let total = position.entry_price - position.liquidation_price;
    if total.is_zero() {
        return false;
    }
    let remaining = position.current_price - position.liquidation_price;
    // Same sign for LONG (both positive) and SHORT (both negative)
    (remaining / total) <= liq_warning_remaining_fraction()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use propel_execution::Side;
    use rust_decimal_macros::dec;
    use smol_str::SmolStr;

    fn position(side: Side, entry: Decimal, current: Decimal, liq: Decimal) -> Position {
        Position {
            id: PositionId::random(),
            account_id: AccountId::random(),
            symbol: SmolStr::new("BTCUSDT"),
            side,
            quantity: dec!(0.1),
            leverage: 20,
            entry_price: entry,
            entry_value: entry * dec!(0.1),
            margin: entry * dec!(0.1) / dec!(20),
            entry_fee: dec!(3.25),
            take_profit: None,
            stop_loss: None,
            liquidation_price: liq,
            current_price: current,
            unrealized_pnl: Decimal::ZERO,
            entry_reference_price: entry,
            accumulated_funding: Decimal::ZERO,
            last_funding_at: None,
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_liquidation_imminent_long() {
        // Entry 65000, liq 62075: warning line sits at 62660
        let safe = position(Side::Long, dec!(65000), dec!(64000), dec!(62075));
        assert!(!liquidation_imminent(&safe));

        let close_to_liq = position(Side::Long, dec!(65000), dec!(62500), dec!(62075));
        assert!(liquidation_imminent(&close_to_liq));
    }

    #[test]
    fn test_liquidation_imminent_short() {
        // Entry 65000, liq 67925: warning line sits at 67340
        let safe = position(Side::Short, dec!(65000), dec!(66000), dec!(67925));
        assert!(!liquidation_imminent(&safe));

        let close_to_liq = position(Side::Short, dec!(65000), dec!(67500), dec!(67925));
        assert!(liquidation_imminent(&close_to_liq));
    }
}
