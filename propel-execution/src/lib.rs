#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Propel-Execution
//! Domain model for the Propel trading engine.
//!
//! Defines the entities shared between the engine's executors, state managers and
//! persistence layer:
//! * **Positions**: open leveraged exposure, with margin / PnL / liquidation calculators.
//! * **Orders**: market order requests and pending limit orders with margin reservations.
//! * **Trades**: immutable records of closed positions (full or partial).
//! * **Trade events**: append-only audit rows carrying a SHA-256 hash over a canonical
//!   field set, supporting downstream audit-chain verification.
//!
//! All monetary quantities are exact [`rust_decimal::Decimal`]s end-to-end, serialized as
//! decimal strings. Binary floats never touch balances.

use derive_more::{Constructor, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Position, order-request and pending-order models, plus margin calculators.
pub mod order;

/// Open position model and PnL / liquidation calculators.
pub mod position;

/// Immutable closed-trade record.
pub mod trade;

/// Append-only audit event with canonical hash.
pub mod event;

/// Side of an open exposure or order.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[serde(alias = "long", alias = "buy", alias = "BUY")]
    Long,
    #[serde(alias = "short", alias = "sell", alias = "SELL")]
    Short,
}

impl Side {
    /// The side an exit order takes to flatten exposure on `self`.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Side::Long => "LONG",
                Side::Short => "SHORT",
            }
        )
    }
}

/// Unique trading account identifier.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    From,
    Constructor,
)]
pub struct AccountId(pub Uuid);

impl AccountId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Unique position identifier.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    From,
    Constructor,
)]
pub struct PositionId(pub Uuid);

impl PositionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Unique engine-assigned order identifier.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    From,
    Constructor,
)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Unique closed-trade identifier.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    From,
    Constructor,
)]
pub struct TradeId(pub Uuid);

impl TradeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Client-supplied idempotency key for an order. Enforced unique at the store level; a retry
/// carrying a known key returns the original outcome without re-filling.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, derive_more::Display, From,
)]
pub struct ClientOrderId(pub SmolStr);

impl ClientOrderId {
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }
}

/// User identifier owning one or more trading accounts. Assigned by the external signup flow.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    From,
    Constructor,
)]
pub struct UserId(pub Uuid);
