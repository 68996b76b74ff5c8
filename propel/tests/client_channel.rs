use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use propel::{
    cache::{InMemorySharedCache, SharedCache},
    config::EngineConfig,
    engine::{
        Engine,
        account::{Account, AccountStatus, EvaluationPlan, PlanKind},
    },
    persistence::{Repository, memory::InMemoryRepository},
    server::session::handle_connection,
};
use propel_data::BookTickerUpdate;
use propel_execution::{AccountId, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

fn config() -> EngineConfig {
    let mut spreads = std::collections::HashMap::new();
    spreads.insert(SmolStr::new("BTCUSDT"), Decimal::ZERO);
    EngineConfig {
        upstream_ws_url: url::Url::parse("wss://example.invalid").unwrap(),
        database_url: String::new(),
        redis_url: String::new(),
        symbols: vec![SmolStr::new("BTCUSDT")],
        maintenance_margin_pct: dec!(0.005),
        entry_fee_pct: dec!(0.0005),
        default_spread_bps: dec!(2),
        symbol_spreads: spreads,
        circuit_breaker_threshold_pct: dec!(0.05),
        circuit_breaker_reset: Duration::from_millis(1000),
        price_stale_threshold: Duration::from_millis(5000),
        session_duration: Duration::from_secs(86400),
        bind_addr: "127.0.0.1:0".to_string(),
        account_flush_interval: Duration::from_millis(1000),
        account_flush_queue_depth: 64,
        default_funding_rate: dec!(0.0001),
    }
}

fn account(user_id: UserId) -> Account {
    let now = Utc::now();
    Account {
        id: AccountId::random(),
        user_id,
        account_number: SmolStr::new("PF-100002"),
        status: AccountStatus::Active,
        breach_kind: None,
        evaluation_step: 1,
        plan: EvaluationPlan {
            kind: PlanKind::OneStep,
            btc_eth_max_leverage: 20,
            altcoin_max_leverage: 10,
            profit_split_pct: dec!(80),
            min_trading_days: 3,
        },
        starting_balance: dec!(10000),
        current_balance: dec!(10000),
        peak_balance: dec!(10000),
        margin_used: Decimal::ZERO,
        available_margin: dec!(10000),
        reserved_margin: Decimal::ZERO,
        daily_starting_balance: dec!(10000),
        daily_pnl: Decimal::ZERO,
        daily_reset_at: now + chrono::TimeDelta::days(1),
        daily_loss_limit: dec!(500),
        max_drawdown_limit: dec!(1000),
        profit_target: dec!(1000),
        trading_days: 0,
        total_trades: 0,
        winning_trades: 0,
        losing_trades: 0,
        closed_today: false,
        daily_trades: 0,
        daily_volume: Decimal::ZERO,
        last_trade_at: None,
    }
}

async fn next_json(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> serde_json::Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for server message")
            .expect("stream ended")
            .expect("socket error")
        {
            Message::Text(payload) => return serde_json::from_str(&payload).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_auth_subscribe_and_trade_round_trip() {
    let repository = Arc::new(InMemoryRepository::new());
    let cache = Arc::new(InMemorySharedCache::new());
    let engine = Arc::new(Engine::new(
        config(),
        Arc::clone(&repository) as Arc<dyn Repository>,
        cache,
    ));

    let user_id = UserId(Uuid::new_v4());
    let seeded = account(user_id);
    let account_id = seeded.id;
    repository.seed_account(seeded.clone());
    repository.seed_session("tok-1", user_id, Utc::now() + chrono::TimeDelta::hours(1));
    engine.accounts.insert(seeded);

    engine
        .process_tick(BookTickerUpdate {
            symbol: SmolStr::new("BTCUSDT"),
            bid: dec!(65000),
            ask: dec!(65000),
            time: Utc::now(),
        })
        .await;

    // Single-connection listener standing in for the server accept loop
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let accept_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        handle_connection(accept_engine, stream, peer, shutdown_rx).await;
    });

    let (websocket, _) = connect_async(format!("ws://{addr}/?token=tok-1"))
        .await
        .unwrap();
    let (mut sink, mut stream) = websocket.split();

    // Initial snapshot arrives without being asked
    let snapshot = next_json(&mut stream).await;
    assert_eq!(snapshot["type"], "ACCOUNT_UPDATED");
    assert_eq!(snapshot["account"]["current_balance"], "10000");

    // Subscribe and receive a live tick
    sink.send(Message::Text(
        r#"{"type":"SUBSCRIBE","symbols":["BTCUSDT"]}"#.into(),
    ))
    .await
    .unwrap();
    let subscribed = next_json(&mut stream).await;
    assert_eq!(subscribed["type"], "SUBSCRIBED");

    engine
        .process_tick(BookTickerUpdate {
            symbol: SmolStr::new("BTCUSDT"),
            bid: dec!(65010),
            ask: dec!(65010),
            time: Utc::now(),
        })
        .await;
    let tick = next_json(&mut stream).await;
    assert_eq!(tick["type"], "PRICE_TICK");
    assert_eq!(tick["tick"]["mid"], "65010");

    // Place an order over the wire
    let order = serde_json::json!({
        "type": "PLACE_ORDER",
        "account_id": account_id.0,
        "symbol": "BTCUSDT",
        "side": "LONG",
        "quantity": "0.1",
        "order_type": "MARKET",
        "leverage": 20,
        "client_order_id": "ws-ord-1",
        "timestamp": Utc::now().to_rfc3339(),
    });
    sink.send(Message::Text(order.to_string().into()))
        .await
        .unwrap();

    // The session receives the position fan-out, account update and the fill response
    let mut seen_types = Vec::new();
    for _ in 0..3 {
        let message = next_json(&mut stream).await;
        seen_types.push(message["type"].as_str().unwrap().to_string());
    }
    assert!(seen_types.iter().any(|kind| kind == "POSITION_OPENED"));
    assert!(seen_types.iter().any(|kind| kind == "ACCOUNT_UPDATED"));
    assert!(seen_types.iter().any(|kind| kind == "ORDER_FILLED"));

    assert_eq!(engine.positions.len(), 1);

    shutdown_tx.send(true).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_rejects_bad_token() {
    let repository = Arc::new(InMemoryRepository::new());
    let cache = Arc::new(InMemorySharedCache::new());
    let engine = Arc::new(Engine::new(
        config(),
        Arc::clone(&repository) as Arc<dyn Repository>,
        cache,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        handle_connection(engine, stream, peer, shutdown_rx).await;
    });

    let (websocket, _) = connect_async(format!("ws://{addr}/?token=unknown"))
        .await
        .unwrap();
    let (_, mut stream) = websocket.split();

    let error = next_json(&mut stream).await;
    assert_eq!(error["type"], "ERROR");
    assert_eq!(error["message"], "authentication failed");

    // Server closes after the rejection
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(_))) | None => break true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break true,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}
