use crate::{AccountId, PositionId, Side, TradeId};
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt::{Display, Formatter};

/// Why a position (or a slice of one) was closed.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Manual,
    TakeProfit,
    StopLoss,
    Liquidation,
    Breach,
}

/// Immutable record of a closed position slice (full or partial close).
///
/// Snapshots the position fields at close; appended once per close and never mutated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Trade {
    pub id: TradeId,
    pub position_id: PositionId,
    pub account_id: AccountId,
    pub symbol: SmolStr,
    pub side: Side,

    /// Quantity closed by this trade (≤ the position quantity at close time).
    pub quantity: Decimal,
    pub leverage: u32,

    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Notional of the closed slice at entry.
    pub entry_value: Decimal,
    /// Notional of the closed slice at exit: `quantity · exit_price`.
    pub exit_value: Decimal,

    /// Pro-rata share of the position's entry fee attributable to this slice.
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,

    pub gross_pnl: Decimal,
    /// `gross_pnl − exit_fee`. The entry fee was already debited at fill.
    pub net_pnl: Decimal,

    pub reason: CloseReason,

    /// Upstream mid at position entry.
    pub entry_reference_price: Decimal,
    /// Upstream mid at close.
    pub exit_reference_price: Decimal,

    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl Trade {
    /// Holding duration of the closed slice.
    pub fn duration(&self) -> TimeDelta {
        self.closed_at.signed_duration_since(self.opened_at)
    }

    /// Whether this trade realized a profit net of fees.
    pub fn is_winning(&self) -> bool {
        self.net_pnl > Decimal::ZERO
    }
}

impl Display for Trade {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ symbol: {}, side: {}, qty: {}, entry: {}, exit: {}, net_pnl: {}, reason: {:?} }}",
            self.symbol,
            self.side,
            self.quantity,
            self.entry_price,
            self.exit_price,
            self.net_pnl,
            self.reason
        )
    }
}
