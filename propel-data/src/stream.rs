use crate::{
    FeedEvent, UpstreamEvent,
    binance::{BinanceCombinedMessage, book_ticker::BinanceBookTicker, depth::BinanceDepth10},
    error::DataError,
};
use futures_util::{SinkExt, StreamExt};
use propel_integration::{
    channel::Tx,
    error::SocketError,
    protocol::{
        StreamParser,
        websocket::{WebSocketSerdeParser, WsMessage, connect},
    },
};
use rand::Rng;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, sleep};
use tracing::{debug, info, warn};
use url::Url;

/// Default [`ReconnectionBackoffPolicy`] for an upstream feed.
pub const FEED_RECONNECTION_POLICY: ReconnectionBackoffPolicy = ReconnectionBackoffPolicy {
    backoff_ms_initial: 125,
    backoff_multiplier: 2,
    backoff_ms_max: 60_000,
};

/// Consecutive connection failures tolerated before entering a cooldown.
pub const FAILURES_BEFORE_COOLDOWN: u32 = 10;

/// Cooldown slept after [`FAILURES_BEFORE_COOLDOWN`] consecutive failures, after which the
/// reconnection cycle restarts from the initial backoff.
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(60);

/// Application Ping cadence on an established socket.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Sliding liveness window: if no frame (Pong or otherwise) arrives within this window the
/// socket is presumed dead and terminated.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// Reconnection backoff policy dictating how the exponential backoff scales between
/// reconnection attempts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReconnectionBackoffPolicy {
    pub backoff_ms_initial: u64,
    pub backoff_multiplier: u64,
    pub backoff_ms_max: u64,
}

impl ReconnectionBackoffPolicy {
    /// Base backoff duration for the provided zero-indexed attempt, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .backoff_multiplier
            .checked_pow(attempt)
            .and_then(|multiplier| multiplier.checked_mul(self.backoff_ms_initial))
            .unwrap_or(self.backoff_ms_max)
            .min(self.backoff_ms_max);

        Duration::from_millis(delay_ms)
    }

    /// Backoff for the provided attempt with ±20% jitter applied, de-synchronising herds of
    /// reconnecting feeds.
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let factor: f64 = rand::rng().random_range(0.8..1.2);
        base.mul_f64(factor)
    }
}

/// Run an upstream combined-stream feed forever, forwarding normalised [`UpstreamEvent`]s to
/// the provided transmitter.
///
/// The initial connection failing is non-fatal: the engine starts in a no-quotes degraded mode
/// and this task keeps retrying in the background. The task only returns once `shutdown`
/// observes `true` or every event receiver is dropped.
pub async fn run_feed<FeedTx>(
    url: Url,
    tx: FeedTx,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) where
    FeedTx: Tx<Item = FeedEvent<UpstreamEvent>>,
{
    let policy = FEED_RECONNECTION_POLICY;
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let websocket = tokio::select! {
            connection = connect(url.as_str()) => connection,
            _ = shutdown.changed() => return,
        };

        match websocket {
            Ok(websocket) => {
                info!(%url, "upstream feed connected");
                failures = 0;

                let outcome = drive_socket(websocket, &tx, &mut shutdown).await;
                match outcome {
                    SocketOutcome::Shutdown => return,
                    SocketOutcome::ReceiverDropped => return,
                    SocketOutcome::Disconnected(error) => {
                        warn!(%url, ?error, "upstream feed disconnected");
                        if tx.send(FeedEvent::Reconnecting).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(error) => {
                failures += 1;
                warn!(%url, attempt = failures, ?error, "upstream feed connect failed");

                if failures >= FAILURES_BEFORE_COOLDOWN {
                    warn!(
                        %url,
                        cooldown_s = FAILURE_COOLDOWN.as_secs(),
                        "upstream feed entering cooldown"
                    );
                    failures = 0;
                    tokio::select! {
                        _ = sleep(FAILURE_COOLDOWN) => {},
                        _ = shutdown.changed() => return,
                    }
                } else {
                    let delay = policy.jittered_delay_for_attempt(failures - 1);
                    tokio::select! {
                        _ = sleep(delay) => {},
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }
}

enum SocketOutcome {
    Shutdown,
    ReceiverDropped,
    Disconnected(DataError),
}

/// Drive an established socket: forward parsed events, Ping every [`PING_INTERVAL`], and
/// terminate if the socket is silent for longer than [`LIVENESS_WINDOW`].
async fn drive_socket<FeedTx>(
    mut websocket: propel_integration::protocol::websocket::WebSocket,
    tx: &FeedTx,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> SocketOutcome
where
    FeedTx: Tx<Item = FeedEvent<UpstreamEvent>>,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_contact = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = websocket.close(None).await;
                return SocketOutcome::Shutdown;
            }
            _ = ping_interval.tick() => {
                if last_contact.elapsed() > LIVENESS_WINDOW {
                    let _ = websocket.close(None).await;
                    return SocketOutcome::Disconnected(DataError::LivenessExpired);
                }
                if let Err(error) = websocket.send(WsMessage::Ping(Vec::new().into())).await {
                    return SocketOutcome::Disconnected(DataError::Socket(error.into()));
                }
            }
            message = websocket.next() => {
                let Some(input) = message else {
                    return SocketOutcome::Disconnected(DataError::Socket(
                        SocketError::Terminated("stream ended".to_string()).into(),
                    ));
                };
                if input.is_ok() {
                    last_contact = Instant::now();
                }

                let parsed: Option<Result<BinanceCombinedMessage, SocketError>> =
                    WebSocketSerdeParser::parse(input);
                match parsed {
                    // Ping/Pong and other non-data frames carry no payload
                    None => {}
                    Some(Ok(combined)) => {
                        if let Some(event) = normalise_combined(combined) {
                            if tx.send(FeedEvent::Item(event)).is_err() {
                                return SocketOutcome::ReceiverDropped;
                            }
                        }
                    }
                    Some(Err(
                        error @ (SocketError::Deserialise { .. }
                        | SocketError::DeserialiseBinary { .. }),
                    )) => {
                        debug!(?error, "discarding unparseable upstream payload");
                    }
                    Some(Err(error)) => {
                        return SocketOutcome::Disconnected(DataError::Socket(error));
                    }
                }
            }
        }
    }
}

/// Normalise a combined-stream envelope into an [`UpstreamEvent`], dispatching on the
/// stream name suffix. Unrecognised streams and malformed payloads yield `None`.
fn normalise_combined(combined: BinanceCombinedMessage) -> Option<UpstreamEvent> {
    if combined.stream.ends_with("@bookTicker") {
        match serde_json::from_value::<BinanceBookTicker>(combined.data) {
            Ok(ticker) => Some(UpstreamEvent::BookTicker(ticker.into())),
            Err(error) => {
                debug!(?error, stream = %combined.stream, "failed to parse book ticker");
                None
            }
        }
    } else if combined.stream.contains("@depth") {
        match serde_json::from_value::<BinanceDepth10>(combined.data) {
            Ok(depth) => Some(UpstreamEvent::Depth(depth.into())),
            Err(error) => {
                debug!(?error, stream = %combined.stream, "failed to parse depth snapshot");
                None
            }
        }
    } else {
        debug!(stream = %combined.stream, "unrecognised combined stream");
        None
    }
}
