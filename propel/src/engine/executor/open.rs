use crate::{
    cache::rate_limit::LimitAction,
    engine::{
        Engine,
        account::Account,
        executor::{OrderOutcome, OrderRejection},
        price::PriceTick,
    },
    persistence::FillRecord,
    server::message::ServerMessage,
};
use chrono::{TimeDelta, Utc};
use propel_execution::{
    ClientOrderId, OrderId, PositionId, Side, UserId,
    event::{TradeEvent, TradeEventKind},
    order::{OrderRequest, OrderType, PendingOrder},
    position::{
        Position, calculate_fee, calculate_initial_margin, calculate_liquidation_price,
        calculate_notional, calculate_unrealized_pnl,
    },
};
use rust_decimal::Decimal;
use serde_json::json;
use smol_str::SmolStr;
use tracing::{info, warn};

/// Client request timestamps may lag engine time by at most this much.
fn max_past_skew() -> TimeDelta {
    TimeDelta::seconds(3)
}

/// Client request timestamps may lead engine time by at most this much.
fn max_future_skew() -> TimeDelta {
    TimeDelta::seconds(1)
}

/// Parameters of a fill about to execute, shared by the market path and the
/// pending-limit-order path.
struct FillSpec {
    symbol: SmolStr,
    side: Side,
    quantity: Decimal,
    leverage: u32,
    fill_price: Decimal,
    entry_reference_price: Decimal,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
    client_order_id: Option<ClientOrderId>,
    /// Existing order row to flip to filled (limit fills); `None` inserts a fresh row.
    existing_order_id: Option<OrderId>,
}

impl Engine {
    /// Synchronous place-order pipeline. All state mutation happens under the account
    /// lock, and the whole path settles in single-digit milliseconds against a healthy
    /// store.
    pub async fn place_order(
        &self,
        user_id: UserId,
        request: OrderRequest,
    ) -> Result<OrderOutcome, OrderRejection> {
        let now = Utc::now();

        if request.quantity <= Decimal::ZERO {
            return Err(OrderRejection::InvalidQuantity);
        }
        if request.leverage == Some(0) {
            return Err(OrderRejection::InvalidLeverage);
        }

        let mut account = self
            .accounts
            .lock(request.account_id)
            .await
            .ok_or(OrderRejection::AccountNotFound)?;

        // Ownership failures look identical to unknown accounts
        if account.user_id != user_id {
            return Err(OrderRejection::AccountNotFound);
        }

        // 1. Timestamp window
        let skew = now.signed_duration_since(request.timestamp);
        if skew > max_past_skew() || skew < -max_future_skew() {
            return Err(OrderRejection::TimestampInvalid);
        }

        // 2. Rate limit
        if !self.limiter.check(user_id, LimitAction::PlaceOrder).await {
            return Err(OrderRejection::RateLimited);
        }

        // 3. Account status
        if !account.status.can_trade() {
            return Err(OrderRejection::AccountNotActive);
        }

        // 4. Price
        let tick = self
            .prices
            .price(&request.symbol)
            .ok_or(OrderRejection::NoPrice)?;
        if self.prices.is_tripped(&request.symbol) {
            return Err(OrderRejection::CircuitOpen);
        }
        if self.prices.is_stale_default(&request.symbol, now) {
            return Err(OrderRejection::StalePrice);
        }

        // Idempotency: a known client_order_id returns the original outcome
        if let Some(client_order_id) = &request.client_order_id {
            match self
                .repository
                .find_fill_by_client_order_id(account.id, client_order_id)
                .await
            {
                Ok(Some(existing)) => {
                    return Ok(OrderOutcome::Duplicate {
                        order_id: existing.order_id,
                        position_id: existing.position_id,
                    });
                }
                Ok(None) => {}
                Err(error) if error.is_transient() => return Err(OrderRejection::PersistFailed),
                Err(_) => return Err(OrderRejection::Internal),
            }
        }

        // 5. Leverage clamp
        let max_leverage = account.max_leverage(&request.symbol);
        let leverage = request.leverage.unwrap_or(max_leverage).clamp(1, max_leverage);

        // 6-7. Margin and affordability on the order's price basis
        let basis_price = match request.order_type {
            OrderType::Market => tick.execution_price(request.side),
            OrderType::Limit => match request.limit_price {
                Some(price) if price > Decimal::ZERO => price,
                _ => return Err(OrderRejection::InvalidPrice),
            },
        };
        let notional = calculate_notional(request.quantity, basis_price);
        let margin = calculate_initial_margin(notional, leverage);
        let entry_fee = calculate_fee(notional, self.config.entry_fee_pct);

        if margin + entry_fee > account.available_margin {
            return Err(OrderRejection::InsufficientMargin);
        }

        match request.order_type {
            OrderType::Limit => {
                self.accept_limit_order(&mut account, &request, leverage, margin + entry_fee)
                    .await
            }
            OrderType::Market => {
                let outcome = self
                    .execute_fill_locked(
                        &mut account,
                        FillSpec {
                            symbol: request.symbol.clone(),
                            side: request.side,
                            quantity: request.quantity,
                            leverage,
                            fill_price: tick.execution_price(request.side),
                            entry_reference_price: tick.mid,
                            take_profit: request.take_profit,
                            stop_loss: request.stop_loss,
                            client_order_id: request.client_order_id.clone(),
                            existing_order_id: None,
                        },
                    )
                    .await?;
                Ok(outcome)
            }
        }
    }

    /// Rest a limit order in the pending book with `margin + entry_fee` reserved.
    async fn accept_limit_order(
        &self,
        account: &mut Account,
        request: &OrderRequest,
        leverage: u32,
        reserved: Decimal,
    ) -> Result<OrderOutcome, OrderRejection> {
        let now = Utc::now();
        let order = PendingOrder {
            id: OrderId::random(),
            account_id: account.id,
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            leverage,
            limit_price: request.limit_price.unwrap_or_default(),
            take_profit: request.take_profit,
            stop_loss: request.stop_loss,
            reserved,
            client_order_id: request.client_order_id.clone(),
            expires_at: request.expires_at,
            created_at: now,
        };

        let event = TradeEvent::new(
            account.id,
            TradeEventKind::OrderPlaced,
            None,
            None,
            json!({
                "order_id": order.id.to_string(),
                "symbol": order.symbol.as_str(),
                "side": order.side.to_string(),
                "quantity": order.quantity.to_string(),
                "limit_price": order.limit_price.to_string(),
                "reserved": order.reserved.to_string(),
            }),
            now,
        );

        let before = account.clone();
        account.reserve(reserved);

        match self
            .repository
            .persist_limit_accept(&order, account, &event)
            .await
        {
            Ok(()) => {
                let order_id = order.id;
                self.pending.insert(order);
                self.accounts.mark_dirty(account.id);
                self.emit_account_update(account);
                info!(account = %account.id, %order_id, "limit order accepted");
                Ok(OrderOutcome::Accepted { order_id })
            }
            Err(error) => {
                *account = before;
                if matches!(error, crate::error::PersistError::UniqueViolation(_)) {
                    self.duplicate_from_store(account.id, request.client_order_id.as_ref())
                        .await
                } else if error.is_transient() {
                    Err(OrderRejection::PersistFailed)
                } else {
                    Err(OrderRejection::Internal)
                }
            }
        }
    }

    /// Execute a fill: construct the position, mutate account state, persist the fill
    /// transaction, register indexes/triggers and fan out.
    async fn execute_fill_locked(
        &self,
        account: &mut Account,
        spec: FillSpec,
    ) -> Result<OrderOutcome, OrderRejection> {
        let now = Utc::now();
        let notional = calculate_notional(spec.quantity, spec.fill_price);
        let margin = calculate_initial_margin(notional, spec.leverage);
        let entry_fee = calculate_fee(notional, self.config.entry_fee_pct);

        let position = Position {
            id: PositionId::random(),
            account_id: account.id,
            symbol: spec.symbol.clone(),
            side: spec.side,
            quantity: spec.quantity,
            leverage: spec.leverage,
            entry_price: spec.fill_price,
            entry_value: notional,
            margin,
            entry_fee,
            take_profit: spec.take_profit,
            stop_loss: spec.stop_loss,
            liquidation_price: calculate_liquidation_price(
                spec.side,
                spec.fill_price,
                spec.leverage,
                self.config.maintenance_margin_pct,
            ),
            current_price: spec.fill_price,
            unrealized_pnl: calculate_unrealized_pnl(
                spec.side,
                spec.fill_price,
                spec.fill_price,
                spec.quantity,
            ),
            entry_reference_price: spec.entry_reference_price,
            accumulated_funding: Decimal::ZERO,
            last_funding_at: None,
            opened_at: now,
        };

        let order_id = spec.existing_order_id.unwrap_or_else(OrderId::random);
        let event = TradeEvent::new(
            account.id,
            TradeEventKind::PositionOpened,
            Some(position.id),
            None,
            json!({
                "order_id": order_id.to_string(),
                "symbol": position.symbol.as_str(),
                "side": position.side.to_string(),
                "quantity": position.quantity.to_string(),
                "entry_price": position.entry_price.to_string(),
                "leverage": position.leverage,
                "margin": position.margin.to_string(),
                "entry_fee": position.entry_fee.to_string(),
            }),
            now,
        );

        let before = account.clone();
        account.apply_order_fill(notional, margin, entry_fee, now);

        let record = FillRecord {
            position: &position,
            order_id,
            client_order_id: spec.client_order_id.as_ref(),
            account,
            event: &event,
        };

        let persisted = match spec.existing_order_id {
            Some(_) => self.repository.persist_limit_fill(&record).await,
            None => self.repository.persist_fill(&record).await,
        };

        if let Err(error) = persisted {
            *account = before;
            return if matches!(error, crate::error::PersistError::UniqueViolation(_)) {
                self.duplicate_from_store(account.id, spec.client_order_id.as_ref())
                    .await
            } else if error.is_transient() {
                Err(OrderRejection::PersistFailed)
            } else {
                warn!(?error, "fill persistence failed");
                Err(OrderRejection::Internal)
            };
        }

        self.positions.add(position.clone());
        self.triggers.register(&position);
        self.accounts.mark_dirty(account.id);

        self.sessions.send_to_account(
            account.id,
            &ServerMessage::PositionOpened {
                position: position.clone(),
            },
        );
        self.emit_account_update(account);

        info!(
            account = %account.id,
            position = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            quantity = %position.quantity,
            entry = %position.entry_price,
            "position opened"
        );

        Ok(OrderOutcome::Filled { order_id, position })
    }

    /// Resolve a unique-violation race into the original outcome.
    async fn duplicate_from_store(
        &self,
        account_id: propel_execution::AccountId,
        client_order_id: Option<&ClientOrderId>,
    ) -> Result<OrderOutcome, OrderRejection> {
        let Some(client_order_id) = client_order_id else {
            return Err(OrderRejection::Internal);
        };
        match self
            .repository
            .find_fill_by_client_order_id(account_id, client_order_id)
            .await
        {
            Ok(Some(existing)) => Ok(OrderOutcome::Duplicate {
                order_id: existing.order_id,
                position_id: existing.position_id,
            }),
            _ => Err(OrderRejection::Internal),
        }
    }

    /// Fill path for a pending limit order the market has crossed. Skips the request-level
    /// validation of [`Engine::place_order`]; the reservation taken at acceptance funds the
    /// fill.
    pub(crate) async fn fill_pending_order(
        &self,
        order: PendingOrder,
        tick: &PriceTick,
    ) -> Result<(), OrderRejection> {
        let Some(mut account) = self.accounts.lock(order.account_id).await else {
            return Err(OrderRejection::AccountNotFound);
        };

        let before = account.clone();
        account.release_reservation(order.reserved);

        let fill_price = tick.execution_price(order.side);
        let notional = calculate_notional(order.quantity, fill_price);
        let margin = calculate_initial_margin(notional, order.leverage);
        let entry_fee = calculate_fee(notional, self.config.entry_fee_pct);

        // A SHORT can cross at a better (higher) price than its limit, where the recomputed
        // margin exceeds the reservation; cancel rather than over-draw the account
        if margin + entry_fee > account.available_margin {
            *account = before;
            drop(account);
            self.cancel_pending_order_internal(order, "unaffordable_at_fill")
                .await;
            return Err(OrderRejection::InsufficientMargin);
        }

        let outcome = self
            .execute_fill_locked(
                &mut account,
                FillSpec {
                    symbol: order.symbol.clone(),
                    side: order.side,
                    quantity: order.quantity,
                    leverage: order.leverage,
                    fill_price,
                    entry_reference_price: tick.mid,
                    take_profit: order.take_profit,
                    stop_loss: order.stop_loss,
                    client_order_id: order.client_order_id.clone(),
                    existing_order_id: Some(order.id),
                },
            )
            .await;

        match outcome {
            Ok(OrderOutcome::Filled { order_id, position }) => {
                self.pending.remove(order.id);
                self.sessions.send_to_account(
                    account.id,
                    &ServerMessage::OrderFilled {
                        order_id,
                        client_order_id: order.client_order_id,
                        position,
                    },
                );
                Ok(())
            }
            Ok(_) => {
                // Settled previously under the same client order id; the book entry is stale
                self.pending.remove(order.id);
                Ok(())
            }
            Err(rejection) => {
                *account = before;
                Err(rejection)
            }
        }
    }

    /// Cancel a pending limit order on behalf of its owner, releasing the reservation.
    pub async fn cancel_order(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<(), super::CloseRejection> {
        if !self.limiter.check(user_id, LimitAction::Default).await {
            return Err(super::CloseRejection::RateLimited);
        }

        let Some(order) = self.pending.get(order_id) else {
            // Cancelling an already-gone order is idempotent success
            return Ok(());
        };

        let Some(mut account) = self.accounts.lock(order.account_id).await else {
            return Err(super::CloseRejection::NotFound);
        };
        if account.user_id != user_id {
            return Err(super::CloseRejection::NotFound);
        }

        let now = Utc::now();
        let event = TradeEvent::new(
            account.id,
            TradeEventKind::OrderCancelled,
            None,
            None,
            json!({
                "order_id": order.id.to_string(),
                "reason": "user_cancel",
                "released": order.reserved.to_string(),
            }),
            now,
        );

        let before = account.clone();
        account.release_reservation(order.reserved);

        match self
            .repository
            .persist_limit_cancel(order.id, &account, &event)
            .await
        {
            Ok(()) => {
                self.pending.remove(order.id);
                self.accounts.mark_dirty(account.id);
                self.sessions
                    .send_to_account(account.id, &ServerMessage::OrderCancelled { order_id });
                self.emit_account_update(&account);
                Ok(())
            }
            Err(error) if error.is_transient() => {
                *account = before;
                Err(super::CloseRejection::PersistFailed)
            }
            Err(_) => {
                *account = before;
                Err(super::CloseRejection::Internal)
            }
        }
    }

    /// Sweep expired pending orders, releasing their reservations.
    pub async fn sweep_expired_orders(&self) {
        let now = Utc::now();
        for order in self.pending.expired(now) {
            self.cancel_pending_order_internal(order, "expired").await;
        }
    }

    /// Engine-initiated cancel (expiry sweep, unaffordable fills).
    async fn cancel_pending_order_internal(&self, order: PendingOrder, reason: &str) {
        let Some(mut account) = self.accounts.lock(order.account_id).await else {
            return;
        };

        let event = TradeEvent::new(
            account.id,
            TradeEventKind::OrderCancelled,
            None,
            None,
            json!({
                "order_id": order.id.to_string(),
                "reason": reason,
                "released": order.reserved.to_string(),
            }),
            Utc::now(),
        );

        let before = account.clone();
        account.release_reservation(order.reserved);

        match self
            .repository
            .persist_limit_cancel(order.id, &account, &event)
            .await
        {
            Ok(()) => {
                self.pending.remove(order.id);
                self.accounts.mark_dirty(account.id);
                self.sessions.send_to_account(
                    account.id,
                    &ServerMessage::OrderCancelled { order_id: order.id },
                );
                self.emit_account_update(&account);
                info!(order = %order.id, reason, "pending order cancelled");
            }
            Err(error) => {
                // Reservation stays; the sweep retries on its next pass
                *account = before;
                warn!(order = %order.id, ?error, "pending order cancel failed");
            }
        }
    }
}
