use crate::engine::price::PriceTick;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use propel_execution::{AccountId, OrderId, order::PendingOrder};
use smol_str::SmolStr;
use std::collections::HashSet;

/// Limit orders accepted but not yet filled, indexed per symbol and per account.
///
/// On every accepted tick the engine asks for the orders the market crossed and hands each
/// to the fill path; a periodic sweep releases expired reservations.
#[derive(Debug, Default)]
pub struct PendingOrderBook {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    orders: FnvHashMap<OrderId, PendingOrder>,
    by_symbol: FnvHashMap<SmolStr, HashSet<OrderId>>,
    by_account: FnvHashMap<AccountId, HashSet<OrderId>>,
}

impl PendingOrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a limit order into the book.
    pub fn insert(&self, order: PendingOrder) {
        let mut inner = self.inner.write();
        inner
            .by_symbol
            .entry(order.symbol.clone())
            .or_default()
            .insert(order.id);
        inner
            .by_account
            .entry(order.account_id)
            .or_default()
            .insert(order.id);
        inner.orders.insert(order.id, order);
    }

    /// Remove an order (filled, cancelled or expired). Returns it for settlement.
    pub fn remove(&self, id: OrderId) -> Option<PendingOrder> {
        let mut inner = self.inner.write();
        let order = inner.orders.remove(&id)?;

        if let Some(set) = inner.by_symbol.get_mut(&order.symbol) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_symbol.remove(&order.symbol);
            }
        }
        if let Some(set) = inner.by_account.get_mut(&order.account_id) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_account.remove(&order.account_id);
            }
        }

        Some(order)
    }

    pub fn get(&self, id: OrderId) -> Option<PendingOrder> {
        self.inner.read().orders.get(&id).cloned()
    }

    /// All pending orders for an account.
    pub fn get_by_account(&self, account_id: AccountId) -> Vec<PendingOrder> {
        let inner = self.inner.read();
        inner
            .by_account
            .get(&account_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.orders.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Orders on the tick's symbol that the derived quote has crossed.
    pub fn crossed(&self, tick: &PriceTick) -> Vec<PendingOrder> {
        let inner = self.inner.read();
        inner
            .by_symbol
            .get(&tick.symbol)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.orders.get(id))
                    .filter(|order| order.crosses(tick.bid, tick.ask))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Orders past their expiry at `now`, for the periodic sweep.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<PendingOrder> {
        self.inner
            .read()
            .orders
            .values()
            .filter(|order| order.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().orders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propel_execution::Side;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn order(
        symbol: &str,
        side: Side,
        limit_price: Decimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> PendingOrder {
        PendingOrder {
            id: OrderId::random(),
            account_id: AccountId::random(),
            symbol: SmolStr::new(symbol),
            side,
            quantity: dec!(0.1),
            leverage: 20,
            limit_price,
            take_profit: None,
            stop_loss: None,
            reserved: dec!(328.31),
            client_order_id: None,
            expires_at,
            created_at: Utc::now(),
        }
    }

    fn tick(symbol: &str, bid: Decimal, ask: Decimal) -> PriceTick {
        PriceTick {
            symbol: SmolStr::new(symbol),
            upstream_bid: bid,
            upstream_ask: ask,
            mid: (bid + ask) / Decimal::TWO,
            bid,
            ask,
            spread_bps: dec!(2),
            time: Utc::now(),
        }
    }

    #[test]
    fn test_crossed_matches_by_side() {
        let book = PendingOrderBook::new();
        let buy_low = order("BTCUSDT", Side::Long, dec!(64000), None);
        let sell_high = order("BTCUSDT", Side::Short, dec!(66000), None);
        let other_symbol = order("ETHUSDT", Side::Long, dec!(64000), None);
        book.insert(buy_low.clone());
        book.insert(sell_high.clone());
        book.insert(other_symbol);

        // Quote well inside both limits: nothing crossed
        assert!(book.crossed(&tick("BTCUSDT", dec!(64990), dec!(65010))).is_empty());

        // Ask drops to the LONG limit
        let crossed = book.crossed(&tick("BTCUSDT", dec!(63980), dec!(64000)));
        assert_eq!(crossed.len(), 1);
        assert_eq!(crossed[0].id, buy_low.id);

        // Bid rises to the SHORT limit
        let crossed = book.crossed(&tick("BTCUSDT", dec!(66000), dec!(66020)));
        assert_eq!(crossed.len(), 1);
        assert_eq!(crossed[0].id, sell_high.id);
    }

    #[test]
    fn test_remove_clears_indexes() {
        let book = PendingOrderBook::new();
        let pending = order("BTCUSDT", Side::Long, dec!(64000), None);
        let account_id = pending.account_id;
        let id = pending.id;
        book.insert(pending);

        assert_eq!(book.get_by_account(account_id).len(), 1);
        assert!(book.remove(id).is_some());
        assert!(book.get_by_account(account_id).is_empty());
        assert!(book.crossed(&tick("BTCUSDT", dec!(63000), dec!(63010))).is_empty());
        assert!(book.remove(id).is_none());
    }

    #[test]
    fn test_expired_sweep() {
        let now = Utc::now();
        let book = PendingOrderBook::new();
        let live = order("BTCUSDT", Side::Long, dec!(64000), None);
        let expiring = order(
            "BTCUSDT",
            Side::Long,
            dec!(64000),
            Some(now - chrono::TimeDelta::seconds(1)),
        );
        let expiring_id = expiring.id;
        book.insert(live);
        book.insert(expiring);

        let expired = book.expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, expiring_id);
    }
}
