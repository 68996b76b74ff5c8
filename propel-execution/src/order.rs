use crate::{AccountId, ClientOrderId, OrderId, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Kind of order a client may place.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Lifecycle status of an order row in the store of record.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Expired,
}

/// Client request to open exposure. Input to the order executor.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrderRequest {
    pub account_id: AccountId,
    pub symbol: SmolStr,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    /// Requested leverage; clamped to the plan ceiling, defaulting to the ceiling when absent.
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub client_order_id: Option<ClientOrderId>,
    /// Optional expiry for LIMIT orders; swept periodically once passed.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Client-stamped request time, checked against engine time for replay/clock skew.
    pub timestamp: DateTime<Utc>,
}

/// Unfilled limit order resting in the pending-order book.
///
/// `reserved` (margin + entry fee) is debited from the account's available margin at
/// acceptance and released in full on cancel or expiry; at fill it converts into the
/// position's margin and fee debit.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PendingOrder {
    pub id: OrderId,
    pub account_id: AccountId,
    pub symbol: SmolStr,
    pub side: Side,
    pub quantity: Decimal,
    pub leverage: u32,
    pub limit_price: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub reserved: Decimal,
    pub client_order_id: Option<ClientOrderId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PendingOrder {
    /// Whether the market has crossed this order's limit price.
    ///
    /// A LONG fills when the derived ask reaches down to the limit; a SHORT when the derived
    /// bid reaches up to it.
    pub fn crosses(&self, derived_bid: Decimal, derived_ask: Decimal) -> bool {
        match self.side {
            Side::Long => derived_ask <= self.limit_price,
            Side::Short => derived_bid >= self.limit_price,
        }
    }

    /// Whether this order has expired at the provided instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pending_order(side: Side, limit_price: Decimal) -> PendingOrder {
        PendingOrder {
            id: OrderId::random(),
            account_id: AccountId::random(),
            symbol: SmolStr::new("BTCUSDT"),
            side,
            quantity: dec!(0.1),
            leverage: 20,
            limit_price,
            take_profit: None,
            stop_loss: None,
            reserved: dec!(328.31),
            client_order_id: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_pending_order_crosses() {
        struct TestCase {
            side: Side,
            limit_price: Decimal,
            derived_bid: Decimal,
            derived_ask: Decimal,
            expected: bool,
        }

        let cases = vec![
            // TC0: LONG fills when ask drops to the limit
            TestCase {
                side: Side::Long,
                limit_price: dec!(64000),
                derived_bid: dec!(63990),
                derived_ask: dec!(64000),
                expected: true,
            },
            // TC1: LONG does not fill above the limit
            TestCase {
                side: Side::Long,
                limit_price: dec!(64000),
                derived_bid: dec!(64490),
                derived_ask: dec!(64500),
                expected: false,
            },
            // TC2: SHORT fills when bid rises to the limit
            TestCase {
                side: Side::Short,
                limit_price: dec!(66000),
                derived_bid: dec!(66000),
                derived_ask: dec!(66010),
                expected: true,
            },
            // TC3: SHORT does not fill below the limit
            TestCase {
                side: Side::Short,
                limit_price: dec!(66000),
                derived_bid: dec!(65500),
                derived_ask: dec!(65510),
                expected: false,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let order = pending_order(test.side, test.limit_price);
            assert_eq!(
                order.crosses(test.derived_bid, test.derived_ask),
                test.expected,
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_pending_order_expiry() {
        let now = Utc::now();
        let mut order = pending_order(Side::Long, dec!(64000));

        assert!(!order.is_expired(now));

        order.expires_at = Some(now - chrono::TimeDelta::seconds(1));
        assert!(order.is_expired(now));

        order.expires_at = Some(now + chrono::TimeDelta::seconds(60));
        assert!(!order.is_expired(now));
    }
}
