use crate::DepthUpdate;
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Single price level in a depth snapshot.
#[derive(
    Debug, Copy, Clone, PartialEq, PartialOrd, Deserialize, Serialize, Constructor,
)]
#[serde(from = "(Decimal, Decimal)")]
pub struct Level {
    pub price: Decimal,
    pub amount: Decimal,
}

impl From<(Decimal, Decimal)> for Level {
    fn from((price, amount): (Decimal, Decimal)) -> Self {
        Self { price, amount }
    }
}

/// [`Binance`](super::BinanceChannel::DEPTH_10) partial depth snapshot message.
///
/// ### Raw Payload Example
/// See docs: <https://binance-docs.github.io/apidocs/futures/en/#partial-book-depth-streams>
/// ```json
/// {
///     "e":"depthUpdate",
///     "E":1671621244673,
///     "T":1671621244670,
///     "s":"BTCUSDT",
///     "U":390497796,
///     "u":390497878,
///     "pu":390497794,
///     "b":[["16858.90","13.692"]],
///     "a":[["16859.00","30.219"]]
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceDepth10 {
    #[serde(alias = "s")]
    pub symbol: SmolStr,
    #[serde(
        alias = "T",
        deserialize_with = "propel_integration::de::de_u64_epoch_ms_as_datetime_utc",
        default = "Utc::now"
    )]
    pub time: DateTime<Utc>,
    #[serde(alias = "b", default)]
    pub bids: Vec<Level>,
    #[serde(alias = "a", default)]
    pub asks: Vec<Level>,
}

impl From<BinanceDepth10> for DepthUpdate {
    fn from(depth: BinanceDepth10) -> Self {
        Self {
            symbol: depth.symbol,
            bids: depth.bids,
            asks: depth.asks,
            time: depth.time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_binance_depth10_de() {
        let input = r#"
        {
            "e":"depthUpdate",
            "E":1671621244673,
            "T":1671621244670,
            "s":"BTCUSDT",
            "U":390497796,
            "u":390497878,
            "pu":390497794,
            "b":[["16858.90","13.692"],["16858.80","2.500"]],
            "a":[["16859.00","30.219"]]
        }"#;

        let actual = serde_json::from_str::<BinanceDepth10>(input).unwrap();
        assert_eq!(actual.symbol, SmolStr::new("BTCUSDT"));
        assert_eq!(
            actual.bids,
            vec![
                Level::new(dec!(16858.90), dec!(13.692)),
                Level::new(dec!(16858.80), dec!(2.500)),
            ]
        );
        assert_eq!(actual.asks, vec![Level::new(dec!(16859.00), dec!(30.219))]);
    }
}
