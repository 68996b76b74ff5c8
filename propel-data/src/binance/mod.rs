use crate::error::DataError;
use serde::Deserialize;
use url::Url;

/// Binance real-time book-ticker message model.
pub mod book_ticker;

/// Binance partial depth snapshot message model.
pub mod depth;

/// [`Binance`](https://binance-docs.github.io/apidocs/futures/en/#websocket-market-streams)
/// channel suffix appended to a lowercase market to form a combined stream name.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BinanceChannel(pub &'static str);

impl BinanceChannel {
    /// Real-time best bid/ask channel name.
    ///
    /// See docs: <https://binance-docs.github.io/apidocs/futures/en/#individual-symbol-book-ticker-streams>
    pub const BOOK_TICKER: Self = Self("@bookTicker");

    /// Depth-10 partial book snapshot channel name (100ms cadence).
    ///
    /// See docs: <https://binance-docs.github.io/apidocs/futures/en/#partial-book-depth-streams>
    pub const DEPTH_10: Self = Self("@depth10@100ms");
}

impl AsRef<str> for BinanceChannel {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// Construct the combined-stream endpoint for the provided channel and symbol set.
///
/// Symbols must be lowercase in the stream name, but arrive uppercase in payloads
/// (eg/ subscribe "btcusdt@bookTicker", receive "s":"BTCUSDT").
pub fn combined_stream_url<'a>(
    base: &Url,
    channel: BinanceChannel,
    symbols: impl IntoIterator<Item = &'a str>,
) -> Result<Url, DataError> {
    let streams = symbols
        .into_iter()
        .map(|symbol| format!("{}{}", symbol.to_lowercase(), channel.as_ref()))
        .collect::<Vec<_>>();

    if streams.is_empty() {
        return Err(DataError::SymbolsEmpty);
    }

    let mut url = base.clone();
    url.set_path("/stream");
    url.set_query(Some(&format!("streams={}", streams.join("/"))));
    Ok(url)
}

/// Combined-stream envelope: `{"stream":"<market><channel>","data":{..}}`.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct BinanceCombinedMessage {
    pub stream: String,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_stream_url() {
        struct TestCase {
            channel: BinanceChannel,
            symbols: Vec<&'static str>,
            expected: &'static str,
        }

        let base = Url::parse("wss://fstream.binance.com").unwrap();

        let tests = vec![
            TestCase {
                channel: BinanceChannel::BOOK_TICKER,
                symbols: vec!["BTCUSDT", "ETHUSDT"],
                expected:
                    "wss://fstream.binance.com/stream?streams=btcusdt@bookTicker/ethusdt@bookTicker",
            },
            TestCase {
                channel: BinanceChannel::DEPTH_10,
                symbols: vec!["SOLUSDT"],
                expected: "wss://fstream.binance.com/stream?streams=solusdt@depth10@100ms",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = combined_stream_url(&base, test.channel, test.symbols).unwrap();
            assert_eq!(actual.as_str(), test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_combined_stream_url_rejects_empty_symbols() {
        let base = Url::parse("wss://fstream.binance.com").unwrap();
        assert!(matches!(
            combined_stream_url(&base, BinanceChannel::BOOK_TICKER, []),
            Err(DataError::SymbolsEmpty)
        ));
    }
}
