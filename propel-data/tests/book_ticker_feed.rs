use futures_util::{SinkExt, StreamExt};
use propel_data::{FeedEvent, UpstreamEvent, stream::run_feed};
use propel_integration::channel::mpsc_unbounded;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use url::Url;

#[derive(Debug, Clone)]
struct SendError;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SendError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self
    }
}

async fn run_server(listener: TcpListener, payloads: Vec<String>) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    for payload in payloads {
        ws.send(Message::Text(payload.into())).await.unwrap();
    }
    ws.close(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_feed_normalises_and_signals_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ticker = r#"{
        "stream":"btcusdt@bookTicker",
        "data":{"s":"BTCUSDT","b":"65000.0","B":"1.0","a":"65010.0","A":"2.0","T":1671621244670}
    }"#
    .to_string();
    let depth = r#"{
        "stream":"btcusdt@depth10@100ms",
        "data":{"s":"BTCUSDT","T":1671621244670,"b":[["65000.0","1.0"]],"a":[["65010.0","2.0"]]}
    }"#
    .to_string();

    tokio::spawn(run_server(listener, vec![ticker, depth]));

    let (tx, rx) = mpsc_unbounded::<FeedEvent<UpstreamEvent>, SendError>();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let url = Url::parse(&format!("ws://{addr}")).unwrap();
    let feed = tokio::spawn(async move {
        run_feed(url, tx, shutdown_rx).await;
    });

    let mut stream = rx.into_stream();

    let first = stream.next().await.unwrap();
    match first {
        FeedEvent::Item(UpstreamEvent::BookTicker(update)) => {
            assert_eq!(update.symbol, "BTCUSDT");
            assert_eq!(update.bid.to_string(), "65000.0");
        }
        other => panic!("expected book ticker, got {other:?}"),
    }

    let second = stream.next().await.unwrap();
    assert!(matches!(second, FeedEvent::Item(UpstreamEvent::Depth(_))));

    // Server closed the socket, so the feed must signal a reconnection boundary
    let third = stream.next().await.unwrap();
    assert!(matches!(third, FeedEvent::Reconnecting));

    shutdown_tx.send(true).unwrap();
    feed.await.unwrap();
}
