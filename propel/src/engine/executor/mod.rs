use propel_execution::{
    OrderId, PositionId,
    position::Position,
    trade::Trade,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synchronous place-order pipeline.
pub mod open;

/// Close pipeline with partial-close support.
pub mod close;

/// Machine-readable reason an order was rejected. Serialized verbatim to clients.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderRejection {
    #[error("rate limited")]
    RateLimited,
    #[error("request timestamp outside the accepted window")]
    TimestampInvalid,
    #[error("account is not in a tradeable status")]
    AccountNotActive,
    #[error("account not found")]
    AccountNotFound,
    #[error("no quote available for symbol")]
    NoPrice,
    #[error("quote is stale")]
    StalePrice,
    #[error("circuit breaker open for symbol")]
    CircuitOpen,
    #[error("insufficient available margin")]
    InsufficientMargin,
    #[error("invalid leverage")]
    InvalidLeverage,
    #[error("invalid quantity")]
    InvalidQuantity,
    #[error("invalid limit price")]
    InvalidPrice,
    #[error("persistence failed, retry later")]
    PersistFailed,
    #[error("internal error")]
    Internal,
}

/// Machine-readable reason a close/modify request was rejected.
///
/// Ownership failures surface as `NotFound`, uniformly, so position ids cannot be
/// enumerated by probing.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseRejection {
    #[error("rate limited")]
    RateLimited,
    #[error("position not found")]
    NotFound,
    #[error("no quote available for symbol")]
    NoPrice,
    #[error("quote is stale")]
    StalePrice,
    #[error("invalid close quantity")]
    InvalidQuantity,
    #[error("persistence failed, retry later")]
    PersistFailed,
    #[error("internal error")]
    Internal,
}

/// Successful outcome of a place-order request.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    /// Market order (or crossed limit) filled into a position.
    Filled {
        order_id: OrderId,
        position: Position,
    },
    /// Limit order accepted into the pending book.
    Accepted { order_id: OrderId },
    /// Idempotent replay: this `client_order_id` already settled; the original result is
    /// returned without re-filling.
    Duplicate {
        order_id: OrderId,
        position_id: Option<PositionId>,
    },
}

/// Successful outcome of a close request.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// The position was already gone; closing twice never double-settles.
    AlreadyClosed,
    Closed {
        trade: Trade,
        /// Remainder after a partial close.
        remaining: Option<Position>,
    },
}
