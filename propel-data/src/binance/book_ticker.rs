use crate::BookTickerUpdate;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// [`Binance`](super::BinanceChannel::BOOK_TICKER) real-time book-ticker message.
///
/// ### Raw Payload Examples
/// See docs: <https://binance-docs.github.io/apidocs/futures/en/#individual-symbol-book-ticker-streams>
/// ```json
/// {
///     "e":"bookTicker",
///     "u":2286618712950,
///     "s":"BTCUSDT",
///     "b":"16858.90",
///     "B":"13.692",
///     "a":"16859.00",
///     "A":"30.219",
///     "T":1671621244670,
///     "E":1671621244673
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BinanceBookTicker {
    #[serde(alias = "s")]
    pub symbol: SmolStr,
    #[serde(
        alias = "T",
        deserialize_with = "propel_integration::de::de_u64_epoch_ms_as_datetime_utc",
        default = "Utc::now"
    )]
    pub time: DateTime<Utc>,
    #[serde(alias = "b", with = "rust_decimal::serde::str")]
    pub best_bid_price: Decimal,
    #[serde(alias = "B", with = "rust_decimal::serde::str")]
    pub best_bid_amount: Decimal,
    #[serde(alias = "a", with = "rust_decimal::serde::str")]
    pub best_ask_price: Decimal,
    #[serde(alias = "A", with = "rust_decimal::serde::str")]
    pub best_ask_amount: Decimal,
}

impl From<BinanceBookTicker> for BookTickerUpdate {
    fn from(ticker: BinanceBookTicker) -> Self {
        Self {
            symbol: ticker.symbol,
            bid: ticker.best_bid_price,
            ask: ticker.best_ask_price,
            time: ticker.time,
        }
    }
}
