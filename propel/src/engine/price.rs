use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// Engine-derived quote for a symbol.
///
/// Invariant: `bid ≤ mid ≤ ask`; `time` is monotone per symbol.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PriceTick {
    pub symbol: SmolStr,
    pub upstream_bid: Decimal,
    pub upstream_ask: Decimal,
    pub mid: Decimal,
    /// Derived bid quoted to users: `mid · (1 − spread_bps/20000)`.
    pub bid: Decimal,
    /// Derived ask quoted to users: `mid · (1 + spread_bps/20000)`.
    pub ask: Decimal,
    pub spread_bps: Decimal,
    pub time: DateTime<Utc>,
}

impl PriceTick {
    /// Price at which a new exposure on `side` executes: ask for LONG, bid for SHORT.
    pub fn execution_price(&self, side: propel_execution::Side) -> Decimal {
        match side {
            propel_execution::Side::Long => self.ask,
            propel_execution::Side::Short => self.bid,
        }
    }

    /// Price at which an existing `side` exposure closes: bid for LONG, ask for SHORT.
    pub fn close_price(&self, side: propel_execution::Side) -> Decimal {
        match side {
            propel_execution::Side::Long => self.bid,
            propel_execution::Side::Short => self.ask,
        }
    }
}

/// Outcome of offering an upstream update to the price engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Accepted(PriceTick),
    /// Rejected by the circuit breaker; triggers must not fire and orders fail `CIRCUIT_OPEN`.
    RejectedCircuitOpen,
    /// Symbol is not part of the configured set.
    RejectedUnknownSymbol,
}

#[derive(Debug)]
struct SymbolState {
    spread_bps: Decimal,
    last: Option<PriceTick>,
    last_accepted_mid: Option<Decimal>,
    last_accepted_at: Option<DateTime<Utc>>,
    tripped: bool,
}

/// Derives per-symbol quotes from upstream best bid/ask, applying the configured spread
/// markup, tracking staleness, and gating sudden moves behind a circuit breaker.
///
/// Mutated only by the feed ingress task; readers take cheap shared locks and clone the
/// latest per-symbol snapshot.
#[derive(Debug)]
pub struct PriceEngine {
    state: RwLock<FnvHashMap<SmolStr, SymbolState>>,
    breaker_threshold_pct: Decimal,
    breaker_reset: Duration,
    stale_threshold: Duration,
}

impl PriceEngine {
    pub fn new(
        symbols: impl IntoIterator<Item = (SmolStr, Decimal)>,
        breaker_threshold_pct: Decimal,
        breaker_reset: Duration,
        stale_threshold: Duration,
    ) -> Self {
        let state = symbols
            .into_iter()
            .map(|(symbol, spread_bps)| {
                (
                    symbol,
                    SymbolState {
                        spread_bps,
                        last: None,
                        last_accepted_mid: None,
                        last_accepted_at: None,
                        tripped: false,
                    },
                )
            })
            .collect();

        Self {
            state: RwLock::new(state),
            breaker_threshold_pct,
            breaker_reset,
            stale_threshold,
        }
    }

    /// Offer an upstream best bid/ask update, deriving the quote published to the rest of
    /// the engine.
    pub fn update(
        &self,
        symbol: &str,
        upstream_bid: Decimal,
        upstream_ask: Decimal,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        let mut state = self.state.write();
        let Some(entry) = state.get_mut(symbol) else {
            return TickOutcome::RejectedUnknownSymbol;
        };

        let mid = (upstream_bid + upstream_ask) / Decimal::TWO;

        // Circuit breaker: a tripped symbol stays closed until upstream has been quiet for
        // the reset window, measured from the last accepted tick.
        if let (Some(last_mid), Some(last_at)) = (entry.last_accepted_mid, entry.last_accepted_at) {
            let elapsed = now.signed_duration_since(last_at);
            let within_reset = elapsed
                < chrono::TimeDelta::milliseconds(self.breaker_reset.as_millis() as i64);

            if entry.tripped {
                if within_reset {
                    return TickOutcome::RejectedCircuitOpen;
                }
                entry.tripped = false;
            } else if within_reset && !last_mid.is_zero() {
                let deviation = ((mid - last_mid) / last_mid).abs();
                if deviation > self.breaker_threshold_pct {
                    entry.tripped = true;
                    return TickOutcome::RejectedCircuitOpen;
                }
            }
        }

        // Monotone timestamp per symbol
        let time = match &entry.last {
            Some(last) if last.time > now => last.time,
            _ => now,
        };

        let half_spread = mid * entry.spread_bps / Decimal::from(20_000);
        let tick = PriceTick {
            symbol: SmolStr::new(symbol),
            upstream_bid,
            upstream_ask,
            mid,
            bid: mid - half_spread,
            ask: mid + half_spread,
            spread_bps: entry.spread_bps,
            time,
        };

        entry.last = Some(tick.clone());
        entry.last_accepted_mid = Some(mid);
        entry.last_accepted_at = Some(now);

        TickOutcome::Accepted(tick)
    }

    /// Latest accepted tick for the symbol, if any has been received.
    pub fn price(&self, symbol: &str) -> Option<PriceTick> {
        self.state
            .read()
            .get(symbol)
            .and_then(|entry| entry.last.clone())
    }

    /// Price at which a new `side` exposure would execute right now.
    pub fn execution_price(&self, symbol: &str, side: propel_execution::Side) -> Option<Decimal> {
        self.price(symbol).map(|tick| tick.execution_price(side))
    }

    /// Whether the latest quote is older than `max_age` (or missing entirely).
    pub fn is_stale(&self, symbol: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        match self.price(symbol) {
            Some(tick) => {
                now.signed_duration_since(tick.time)
                    > chrono::TimeDelta::milliseconds(max_age.as_millis() as i64)
            }
            None => true,
        }
    }

    /// Whether the latest quote is older than the engine-configured staleness threshold.
    pub fn is_stale_default(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.is_stale(symbol, self.stale_threshold, now)
    }

    /// Whether the symbol's circuit breaker is currently open.
    pub fn is_tripped(&self, symbol: &str) -> bool {
        self.state
            .read()
            .get(symbol)
            .is_some_and(|entry| entry.tripped)
    }

    /// Override the spread for a symbol at runtime.
    pub fn set_spread(&self, symbol: &str, spread_bps: Decimal) {
        if let Some(entry) = self.state.write().get_mut(symbol) {
            entry.spread_bps = spread_bps;
        }
    }
}
