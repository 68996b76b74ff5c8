use crate::error::EngineError;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{collections::HashMap, str::FromStr, time::Duration};

/// Engine configuration, sourced from the environment at startup.
///
/// Startup aborts if a required variable (`UPSTREAM_WS_URL`, `DATABASE_URL`, `REDIS_URL`) is
/// missing; everything else falls back to the documented defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub upstream_ws_url: url::Url,
    pub database_url: String,
    pub redis_url: String,

    /// Symbols the engine quotes and accepts orders for.
    pub symbols: Vec<SmolStr>,

    /// Maintenance margin as a fraction of notional (default 0.005).
    pub maintenance_margin_pct: Decimal,
    /// Entry/exit fee as a fraction of notional (default 0.0005, ie/ 5 bps).
    pub entry_fee_pct: Decimal,
    /// Spread applied to the upstream mid, in basis points (default 10).
    pub default_spread_bps: Decimal,
    /// Per-symbol spread overlay, in basis points.
    pub symbol_spreads: HashMap<SmolStr, Decimal>,

    /// Circuit breaker trip threshold as a fraction of the last accepted mid (default 0.05).
    pub circuit_breaker_threshold_pct: Decimal,
    /// Quiet period after which a tripped breaker self-heals (default 1000ms).
    pub circuit_breaker_reset: Duration,
    /// Age beyond which a quote is considered stale (default 5000ms).
    pub price_stale_threshold: Duration,

    /// Bearer-token lifetime accepted on session open.
    pub session_duration: Duration,

    /// Client-channel listen address.
    pub bind_addr: String,

    /// Dirty-account flush cadence.
    pub account_flush_interval: Duration,
    /// Dirty-account queue depth forcing an early flush.
    pub account_flush_queue_depth: usize,

    /// Default funding rate per 8h interval applied when no per-symbol rate is configured.
    pub default_funding_rate: Decimal,
}

impl EngineConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        let upstream_ws_url = required("UPSTREAM_WS_URL")?;
        let upstream_ws_url = url::Url::parse(&upstream_ws_url)
            .map_err(|error| EngineError::Config(format!("UPSTREAM_WS_URL invalid: {error}")))?;

        Ok(Self {
            upstream_ws_url,
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            symbols: parse_symbols(&optional(
                "SYMBOLS",
                "BTCUSDT,ETHUSDT,SOLUSDT,BNBUSDT,XRPUSDT",
            )),
            maintenance_margin_pct: parse_decimal("MAINTENANCE_MARGIN_PCT", "0.005")?,
            entry_fee_pct: parse_decimal("ENTRY_FEE_PCT", "0.0005")?,
            default_spread_bps: parse_decimal("DEFAULT_SPREAD_BPS", "10")?,
            symbol_spreads: parse_symbol_spreads(&optional("SYMBOL_SPREADS", "{}"))?,
            circuit_breaker_threshold_pct: parse_decimal("CIRCUIT_BREAKER_THRESHOLD_PCT", "0.05")?,
            circuit_breaker_reset: Duration::from_millis(parse_u64(
                "CIRCUIT_BREAKER_RESET_MS",
                "1000",
            )?),
            price_stale_threshold: Duration::from_millis(parse_u64(
                "PRICE_STALE_THRESHOLD_MS",
                "5000",
            )?),
            session_duration: Duration::from_secs(parse_u64("SESSION_DURATION", "86400")?),
            bind_addr: optional("BIND_ADDR", "0.0.0.0:8900"),
            account_flush_interval: Duration::from_millis(parse_u64(
                "ACCOUNT_FLUSH_INTERVAL_MS",
                "1000",
            )?),
            account_flush_queue_depth: parse_u64("ACCOUNT_FLUSH_QUEUE_DEPTH", "64")? as usize,
            default_funding_rate: parse_decimal("DEFAULT_FUNDING_RATE", "0.0001")?,
        })
    }

    /// Spread in basis points for the provided symbol.
    pub fn spread_bps(&self, symbol: &str) -> Decimal {
        self.symbol_spreads
            .get(symbol)
            .copied()
            .unwrap_or(self.default_spread_bps)
    }
}

/// Whether a symbol belongs to the majors asset class (BTC/ETH), which carries the higher
/// plan leverage ceiling.
pub fn is_major(symbol: &str) -> bool {
    symbol.starts_with("BTC") || symbol.starts_with("ETH")
}

fn required(name: &str) -> Result<String, EngineError> {
    std::env::var(name)
        .map_err(|_| EngineError::Config(format!("required environment variable {name} missing")))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_decimal(name: &str, default: &str) -> Result<Decimal, EngineError> {
    let raw = optional(name, default);
    Decimal::from_str(&raw)
        .map_err(|error| EngineError::Config(format!("{name} invalid decimal: {error}")))
}

fn parse_u64(name: &str, default: &str) -> Result<u64, EngineError> {
    let raw = optional(name, default);
    raw.parse::<u64>()
        .map_err(|error| EngineError::Config(format!("{name} invalid integer: {error}")))
}

fn parse_symbols(raw: &str) -> Vec<SmolStr> {
    raw.split(',')
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(SmolStr::new)
        .collect()
}

fn parse_symbol_spreads(raw: &str) -> Result<HashMap<SmolStr, Decimal>, EngineError> {
    let overlay: HashMap<String, Decimal> = serde_json::from_str(raw)
        .map_err(|error| EngineError::Config(format!("SYMBOL_SPREADS invalid JSON: {error}")))?;

    Ok(overlay
        .into_iter()
        .map(|(symbol, bps)| (SmolStr::new(symbol), bps))
        .collect())
}
