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

//! # Propel
//! Simulated leveraged perpetual-futures engine for prop-firm evaluation accounts.
//!
//! Users open long/short positions on crypto symbols priced against the upstream Binance
//! book-ticker feed; the engine simulates fills, tracks margin and PnL, enforces per-account
//! risk rules (daily loss, maximum drawdown, liquidation), monitors take-profit and stop-loss
//! triggers, and applies periodic funding.
//!
//! At a high-level, it provides a few major components:
//! * `PriceEngine` deriving per-symbol quotes from upstream mid ± spread, with staleness
//!   tracking and a circuit breaker on sudden moves.
//! * Authoritative in-memory state management: `AccountManager` (per-account mutual
//!   exclusion, write-behind flushing) and `PositionManager` (O(1) indexed lookups).
//! * Synchronous order / close executors with margin checking and exactly-once settlement
//!   against the relational store of record.
//! * `TriggerEngine` holding per-symbol sorted TP/SL/liquidation indexes that fire on every
//!   accepted price tick.
//! * Periodic workers: daily UTC reset, 8-hour funding, persistence retry, account flushing.
//! * An authenticated bidirectional WebSocket channel fanning out price ticks and account
//!   events to client sessions.

/// Shared cache (Redis) interaction: rate-limit counters, price snapshots, event fan-out.
pub mod cache;

/// Engine configuration sourced from the environment.
pub mod config;

/// The real-time execution core: price engine, state managers, executors, triggers, risk
/// checks and periodic workers.
pub mod engine;

/// Defines all possible errors in Propel core.
pub mod error;

/// Provides default Propel Tracing logging initialisers.
pub mod logging;

/// Store-of-record repositories (Postgres via sqlx) and the retry-safe write path.
pub mod persistence;

/// Authenticated bidirectional WebSocket channel with client sessions.
pub mod server;

/// Traits and types related to component shutdowns.
pub mod shutdown;

/// Utilities for initialising and running a full engine deployment.
pub mod system;
