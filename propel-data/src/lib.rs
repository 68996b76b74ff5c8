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

//! # Propel-Data
//! Resilient upstream market-data ingestion for the Propel trading engine.
//!
//! Maintains long-lived WebSocket subscriptions to the Binance combined streams for a fixed
//! symbol set, translating raw exchange payloads into normalised engine events:
//! * **Book-ticker feed**: best bid/ask per symbol, the input to the engine's quote derivation.
//! * **Depth feed**: depth-10 snapshots for display fan-out only (never fill pricing).
//! * **Reconnection**: exponential backoff with jitter, a cooldown after repeated failures, and
//!   a ping/pong liveness watchdog that forces a reconnect on a silent socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// All [`Error`](std::error::Error)s generated in Propel-Data.
pub mod error;

/// Binance combined-stream payload models and endpoint construction.
pub mod binance;

/// Continually reconnecting feed task with backoff, jitter and liveness watchdog.
pub mod stream;

/// Normalised upstream market event for a single symbol.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum UpstreamEvent {
    /// Best bid/ask update. Drives quote derivation, triggers and PnL marks.
    BookTicker(BookTickerUpdate),
    /// Depth-10 snapshot. Display fan-out only.
    Depth(DepthUpdate),
}

/// Normalised best bid/ask for a symbol, parsed from an upstream book-ticker message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BookTickerUpdate {
    pub symbol: SmolStr,
    pub bid: rust_decimal::Decimal,
    pub ask: rust_decimal::Decimal,
    pub time: DateTime<Utc>,
}

/// Normalised depth-10 snapshot for a symbol.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DepthUpdate {
    pub symbol: SmolStr,
    pub bids: Vec<binance::depth::Level>,
    pub asks: Vec<binance::depth::Level>,
    pub time: DateTime<Utc>,
}

/// Event emitted by a reconnecting feed.
///
/// `Reconnecting` marks the boundary between one socket lifetime and the next, letting
/// downstream consumers (eg/ staleness accounting) observe feed interruptions.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum FeedEvent<T> {
    Item(T),
    Reconnecting,
}
