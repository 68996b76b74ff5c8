use crate::{AccountId, PositionId, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Open leveraged exposure on a single symbol.
///
/// A position is created whole by an order fill and destroyed (or pro-rata reduced) by a
/// close. There is no netting: two fills on the same `(account, symbol)` produce two
/// positions.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub id: PositionId,
    pub account_id: AccountId,
    pub symbol: SmolStr,
    pub side: Side,

    /// Base quantity. Always > 0; the direction is carried by `side`.
    pub quantity: Decimal,
    pub leverage: u32,

    pub entry_price: Decimal,
    /// Notional at entry: `quantity · entry_price`.
    pub entry_value: Decimal,
    /// Initial margin locked for this position: `entry_value / leverage`.
    pub margin: Decimal,
    pub entry_fee: Decimal,

    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub liquidation_price: Decimal,

    /// Latest mark price (engine-derived bid for LONG, ask for SHORT).
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,

    /// Upstream mid at entry, retained for the closed-trade audit record.
    pub entry_reference_price: Decimal,

    pub accumulated_funding: Decimal,
    pub last_funding_at: Option<DateTime<Utc>>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Update the mark price and recompute `unrealized_pnl`.
    pub fn mark(&mut self, price: Decimal) {
        self.current_price = price;
        self.unrealized_pnl =
            calculate_unrealized_pnl(self.side, self.entry_price, price, self.quantity);
    }

    /// Pro-rata slice of this position for a partial (or full) close of `close_quantity`.
    pub fn close_slice(&self, close_quantity: Decimal) -> CloseSlice {
        let fraction = close_quantity / self.quantity;
        CloseSlice {
            fraction,
            margin_released: self.margin * fraction,
            entry_value_closed: self.entry_value * fraction,
            entry_fee_closed: self.entry_fee * fraction,
        }
    }

    /// Whether `close_quantity` would close the position exactly.
    pub fn is_full_close(&self, close_quantity: Decimal) -> bool {
        close_quantity == self.quantity
    }
}

/// Pro-rata amounts for closing part of a [`Position`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CloseSlice {
    pub fraction: Decimal,
    pub margin_released: Decimal,
    pub entry_value_closed: Decimal,
    pub entry_fee_closed: Decimal,
}

/// Notional value of `quantity` at `price`.
pub fn calculate_notional(quantity: Decimal, price: Decimal) -> Decimal {
    quantity * price
}

/// Initial margin locked for a notional at the provided leverage.
pub fn calculate_initial_margin(notional: Decimal, leverage: u32) -> Decimal {
    notional / Decimal::from(leverage)
}

/// Fee on a notional at the provided rate (eg/ 0.0005 for 5 bps).
pub fn calculate_fee(notional: Decimal, fee_pct: Decimal) -> Decimal {
    notional * fee_pct
}

/// Unrealized PnL of an open position marked at `current_price`.
pub fn calculate_unrealized_pnl(
    side: Side,
    entry_price: Decimal,
    current_price: Decimal,
    quantity: Decimal,
) -> Decimal {
    match side {
        Side::Long => (current_price - entry_price) * quantity,
        Side::Short => (entry_price - current_price) * quantity,
    }
}

/// Price at which a position is force-closed.
///
/// `entry·(1 − 1/leverage + mmr)` for LONG, mirrored for SHORT. The already-paid entry fee
/// is deliberately excluded from the equity term.
pub fn calculate_liquidation_price(
    side: Side,
    entry_price: Decimal,
    leverage: u32,
    maintenance_margin_pct: Decimal,
) -> Decimal {
    let inverse_leverage = Decimal::ONE / Decimal::from(leverage);
    match side {
        Side::Long => entry_price * (Decimal::ONE - inverse_leverage + maintenance_margin_pct),
        Side::Short => entry_price * (Decimal::ONE + inverse_leverage - maintenance_margin_pct),
    }
}
