use crate::{
    cache::rate_limit::LimitAction,
    engine::{
        Engine,
        account::Account,
        executor::{CloseOutcome, CloseRejection},
        trigger::{FiredTrigger, TriggerKind},
    },
    persistence::CloseRecord,
    server::message::ServerMessage,
};
use chrono::Utc;
use propel_execution::{
    PositionId, TradeId, UserId,
    event::{TradeEvent, TradeEventKind},
    position::{Position, calculate_fee, calculate_notional, calculate_unrealized_pnl},
    trade::{CloseReason, Trade},
};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};

impl Engine {
    /// Close a position (fully or partially) on behalf of its owner at the current derived
    /// quote.
    pub async fn close_position(
        &self,
        user_id: UserId,
        position_id: PositionId,
        close_quantity: Option<Decimal>,
    ) -> Result<CloseOutcome, CloseRejection> {
        if !self.limiter.check(user_id, LimitAction::ClosePosition).await {
            return Err(CloseRejection::RateLimited);
        }

        let Some(position) = self.positions.get(position_id) else {
            // Closing an already-closed position succeeds without double-settling
            return Ok(CloseOutcome::AlreadyClosed);
        };

        let Some(mut account) = self.accounts.lock(position.account_id).await else {
            return Err(CloseRejection::NotFound);
        };
        if account.user_id != user_id {
            return Err(CloseRejection::NotFound);
        }

        // Re-resolve under the lock: a trigger may have settled while we waited
        let Some(position) = self.positions.get(position_id) else {
            return Ok(CloseOutcome::AlreadyClosed);
        };

        let now = Utc::now();
        let tick = self
            .prices
            .price(&position.symbol)
            .ok_or(CloseRejection::NoPrice)?;
        if self.prices.is_stale_default(&position.symbol, now) {
            return Err(CloseRejection::StalePrice);
        }

        let close_quantity = close_quantity.unwrap_or(position.quantity);
        let outcome = self
            .settle_close_locked(
                &mut account,
                &position,
                close_quantity,
                tick.close_price(position.side),
                tick.mid,
                CloseReason::Manual,
            )
            .await?;

        self.enforce_risk_locked(&mut account).await;
        Ok(outcome)
    }

    /// Close path for a fired TP/SL/liquidation trigger. The exit price always comes from
    /// the tick that fired the trigger, so staleness checks do not apply.
    pub(crate) async fn close_from_trigger(
        &self,
        fired: &FiredTrigger,
        tick: &crate::engine::price::PriceTick,
    ) -> Result<(), CloseRejection> {
        let Some(mut account) = self.accounts.lock(fired.entry.account_id).await else {
            return Err(CloseRejection::NotFound);
        };

        let Some(position) = self.positions.get(fired.entry.position_id) else {
            // Settled by another path between the scan and this lock; drop stale entries
            self.triggers
                .deregister(&tick.symbol, fired.entry.position_id);
            return Ok(());
        };

        self.settle_close_locked(
            &mut account,
            &position,
            position.quantity,
            fired.exit_price,
            tick.mid,
            fired.reason,
        )
        .await?;

        self.enforce_risk_locked(&mut account).await;
        Ok(())
    }

    /// Settle a close under the account lock: compute the trade, persist it atomically,
    /// then commit the in-memory state and fan out.
    ///
    /// In-memory mutations only commit once the store transaction succeeds, so a failure
    /// here leaves the engine unchanged (and a trigger entry ready to re-fire).
    pub(crate) async fn settle_close_locked(
        &self,
        account: &mut Account,
        position: &Position,
        close_quantity: Decimal,
        exit_price: Decimal,
        exit_reference_price: Decimal,
        reason: CloseReason,
    ) -> Result<CloseOutcome, CloseRejection> {
        if close_quantity <= Decimal::ZERO || close_quantity > position.quantity {
            return Err(CloseRejection::InvalidQuantity);
        }

        let now = Utc::now();
        let full_close = position.is_full_close(close_quantity);
        let slice = position.close_slice(close_quantity);

        // Fatal-taxonomy guard: releasing more margin than the account holds means the
        // position indexes and account state disagree. Poison the account for admin review
        // rather than settle against corrupted state.
        if slice.margin_released > account.margin_used {
            error!(
                account = %account.id,
                position = %position.id,
                margin_released = %slice.margin_released,
                margin_used = %account.margin_used,
                "margin release exceeds account margin - poisoning account"
            );
            account.transition_status(
                crate::engine::account::AccountStatus::Suspended,
                None,
            );
            self.accounts.mark_dirty(account.id);
            self.enqueue_retry(crate::engine::worker::retry::RetryJob::UpdateAccount(
                Box::new(account.clone()),
            ));
            return Err(CloseRejection::Internal);
        }

        let gross_pnl = calculate_unrealized_pnl(
            position.side,
            position.entry_price,
            exit_price,
            close_quantity,
        );
        let exit_value = calculate_notional(close_quantity, exit_price);
        let exit_fee = calculate_fee(exit_value, self.config.entry_fee_pct);
        let net_pnl = gross_pnl - exit_fee;

        let trade = Trade {
            id: TradeId::random(),
            position_id: position.id,
            account_id: account.id,
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: close_quantity,
            leverage: position.leverage,
            entry_price: position.entry_price,
            exit_price,
            entry_value: slice.entry_value_closed,
            exit_value,
            entry_fee: slice.entry_fee_closed,
            exit_fee,
            gross_pnl,
            net_pnl,
            reason,
            entry_reference_price: position.entry_reference_price,
            exit_reference_price,
            opened_at: position.opened_at,
            closed_at: now,
        };

        let remaining = (!full_close).then(|| {
            let mut remaining = position.clone();
            remaining.quantity -= close_quantity;
            remaining.entry_value -= slice.entry_value_closed;
            remaining.margin -= slice.margin_released;
            remaining.entry_fee -= slice.entry_fee_closed;
            remaining.mark(remaining.current_price);
            remaining
        });

        let event = TradeEvent::new(
            account.id,
            TradeEventKind::PositionClosed,
            Some(position.id),
            Some(trade.id),
            json!({
                "symbol": trade.symbol.as_str(),
                "reason": trade.reason,
                "quantity": trade.quantity.to_string(),
                "exit_price": trade.exit_price.to_string(),
                "gross_pnl": trade.gross_pnl.to_string(),
                "net_pnl": trade.net_pnl.to_string(),
                "partial": !full_close,
            }),
            now,
        );

        let before = account.clone();
        account.apply_close(full_close, net_pnl, slice.margin_released, exit_value, now);

        let record = CloseRecord {
            trade: &trade,
            remaining: remaining.as_ref(),
            account,
            event: &event,
        };

        match self.repository.persist_close(&record).await {
            Ok(()) => {}
            Err(crate::error::PersistError::NotFound(_)) => {
                // The store has no such open position: a concurrent settle won. Converge
                // memory onto the store and report idempotent success.
                *account = before;
                error!(
                    position = %position.id,
                    "close raced an already-settled position - converging in-memory state"
                );
                self.positions.remove(position.id);
                self.triggers.deregister(&position.symbol, position.id);
                self.clear_liquidation_warning(position.id);
                return Ok(CloseOutcome::AlreadyClosed);
            }
            Err(persist_error) if persist_error.is_transient() => {
                *account = before;
                return Err(CloseRejection::PersistFailed);
            }
            Err(persist_error) => {
                *account = before;
                warn!(?persist_error, "close persistence failed");
                return Err(CloseRejection::Internal);
            }
        }

        match &remaining {
            Some(remaining) => self.positions.update(remaining.clone()),
            None => {
                self.positions.remove(position.id);
                self.triggers.deregister(&position.symbol, position.id);
                self.clear_liquidation_warning(position.id);
            }
        }
        self.accounts.mark_dirty(account.id);

        // Trigger-initiated closes also leave the matching trigger audit event
        if let Some(kind) = trigger_event_kind(reason) {
            self.record_event(TradeEvent::new(
                account.id,
                kind,
                Some(position.id),
                Some(trade.id),
                json!({
                    "exit_price": trade.exit_price.to_string(),
                    "net_pnl": trade.net_pnl.to_string(),
                }),
                now,
            ));
        }

        let summary = crate::engine::account::AccountSummary::from(&*account);
        let message = match &remaining {
            Some(remaining) => ServerMessage::PositionPartiallyClosed {
                trade: trade.clone(),
                remaining: remaining.clone(),
                account: summary,
            },
            None => ServerMessage::PositionClosed {
                trade: trade.clone(),
                account: summary,
            },
        };
        self.sessions.send_to_account(account.id, &message);
        self.emit_account_update(account);

        info!(
            account = %account.id,
            position = %position.id,
            reason = ?reason,
            quantity = %close_quantity,
            exit = %exit_price,
            net_pnl = %net_pnl,
            full = full_close,
            "position closed"
        );

        Ok(CloseOutcome::Closed { trade, remaining })
    }

    /// Edit a position's TP/SL levels. The engine accepts wrong-side values; the trigger
    /// simply fires on the next qualifying tick.
    pub async fn modify_tpsl(
        &self,
        user_id: UserId,
        position_id: PositionId,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<Position, CloseRejection> {
        if !self
            .limiter
            .check(user_id, LimitAction::ModifyPosition)
            .await
        {
            return Err(CloseRejection::RateLimited);
        }

        let Some(position) = self.positions.get(position_id) else {
            return Err(CloseRejection::NotFound);
        };
        let Some(account) = self.accounts.lock(position.account_id).await else {
            return Err(CloseRejection::NotFound);
        };
        if account.user_id != user_id {
            return Err(CloseRejection::NotFound);
        }

        let Some(mut updated) = self.positions.get(position_id) else {
            return Err(CloseRejection::NotFound);
        };
        let previous_tp = updated.take_profit;
        let previous_sl = updated.stop_loss;
        updated.take_profit = take_profit;
        updated.stop_loss = stop_loss;

        match self.repository.update_position(&updated).await {
            Ok(()) => {}
            Err(persist_error) if persist_error.is_transient() => {
                return Err(CloseRejection::PersistFailed);
            }
            Err(_) => return Err(CloseRejection::Internal),
        }

        let now = Utc::now();
        if previous_tp != take_profit {
            self.triggers
                .update_tp_sl(&updated, TriggerKind::Tp, take_profit);
            self.record_event(TradeEvent::new(
                account.id,
                if previous_tp.is_none() {
                    TradeEventKind::TpSet
                } else {
                    TradeEventKind::TpModified
                },
                Some(position_id),
                None,
                json!({ "take_profit": take_profit.map(|price| price.to_string()) }),
                now,
            ));
        }
        if previous_sl != stop_loss {
            self.triggers
                .update_tp_sl(&updated, TriggerKind::Sl, stop_loss);
            self.record_event(TradeEvent::new(
                account.id,
                if previous_sl.is_none() {
                    TradeEventKind::SlSet
                } else {
                    TradeEventKind::SlModified
                },
                Some(position_id),
                None,
                json!({ "stop_loss": stop_loss.map(|price| price.to_string()) }),
                now,
            ));
        }

        self.positions.update(updated.clone());
        self.sessions.send_to_account(
            account.id,
            &ServerMessage::PositionUpdated {
                position: updated.clone(),
            },
        );

        Ok(updated)
    }
}

fn trigger_event_kind(reason: CloseReason) -> Option<TradeEventKind> {
    match reason {
        CloseReason::TakeProfit => Some(TradeEventKind::TpTriggered),
        CloseReason::StopLoss => Some(TradeEventKind::SlTriggered),
        CloseReason::Liquidation => Some(TradeEventKind::LiquidationTriggered),
        CloseReason::Manual | CloseReason::Breach => None,
    }
}
