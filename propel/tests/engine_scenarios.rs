use chrono::Utc;
use propel::{
    cache::{InMemorySharedCache, SharedCache},
    config::EngineConfig,
    engine::{
        Engine,
        account::{Account, AccountStatus, BreachKind, EvaluationPlan, PlanKind},
        executor::{OrderOutcome, OrderRejection},
    },
    persistence::{Repository, memory::InMemoryRepository},
};
use propel_data::BookTickerUpdate;
use propel_execution::{
    AccountId, ClientOrderId, Side, UserId,
    order::{OrderRequest, OrderType},
    trade::CloseReason,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use smol_str::SmolStr;
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

fn config(symbol_spreads: HashMap<SmolStr, Decimal>) -> EngineConfig {
    EngineConfig {
        upstream_ws_url: url::Url::parse("wss://example.invalid").unwrap(),
        database_url: String::new(),
        redis_url: String::new(),
        symbols: vec![SmolStr::new("BTCUSDT"), SmolStr::new("ETHUSDT")],
        maintenance_margin_pct: dec!(0.005),
        entry_fee_pct: dec!(0.0005),
        default_spread_bps: dec!(2),
        symbol_spreads,
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

fn account(starting_balance: Decimal, user_id: UserId) -> Account {
    let now = Utc::now();
    Account {
        id: AccountId::random(),
        user_id,
        account_number: SmolStr::new("PF-100001"),
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
        starting_balance,
        current_balance: starting_balance,
        peak_balance: starting_balance,
        margin_used: Decimal::ZERO,
        available_margin: starting_balance,
        reserved_margin: Decimal::ZERO,
        daily_starting_balance: starting_balance,
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

struct Harness {
    engine: Arc<Engine>,
    repository: Arc<InMemoryRepository>,
    cache: Arc<InMemorySharedCache>,
    account_id: AccountId,
    user_id: UserId,
}

async fn harness(
    starting_balance: Decimal,
    symbol_spreads: HashMap<SmolStr, Decimal>,
) -> Harness {
    let repository = Arc::new(InMemoryRepository::new());
    let cache = Arc::new(InMemorySharedCache::new());
    let engine = Arc::new(Engine::new(
        config(symbol_spreads),
        Arc::clone(&repository) as Arc<dyn Repository>,
        Arc::clone(&cache) as Arc<dyn SharedCache>,
    ));

    let user_id = UserId(Uuid::new_v4());
    let seeded = account(starting_balance, user_id);
    let account_id = seeded.id;
    repository.seed_account(seeded.clone());
    engine.accounts.insert(seeded);

    Harness {
        engine,
        repository,
        cache,
        account_id,
        user_id,
    }
}

fn tick(symbol: &str, bid: Decimal, ask: Decimal) -> BookTickerUpdate {
    BookTickerUpdate {
        symbol: SmolStr::new(symbol),
        bid,
        ask,
        time: Utc::now(),
    }
}

fn market_order(
    account_id: AccountId,
    symbol: &str,
    side: Side,
    quantity: Decimal,
    leverage: u32,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
) -> OrderRequest {
    OrderRequest {
        account_id,
        symbol: SmolStr::new(symbol),
        side,
        quantity,
        order_type: OrderType::Market,
        limit_price: None,
        leverage: Some(leverage),
        take_profit,
        stop_loss,
        client_order_id: None,
        expires_at: None,
        timestamp: Utc::now(),
    }
}

fn zero_spread() -> HashMap<SmolStr, Decimal> {
    let mut spreads = HashMap::new();
    spreads.insert(SmolStr::new("BTCUSDT"), Decimal::ZERO);
    spreads.insert(SmolStr::new("ETHUSDT"), Decimal::ZERO);
    spreads
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s1_long_open_then_take_profit_fill() {
    let harness = harness(dec!(10000), HashMap::new()).await;
    let engine = &harness.engine;

    // Upstream bid 65000 / ask 65010 with a 2bps spread: mid 65005, derived ask 65011.5005
    engine.process_tick(tick("BTCUSDT", dec!(65000), dec!(65010))).await;

    let outcome = engine
        .place_order(
            harness.user_id,
            market_order(
                harness.account_id,
                "BTCUSDT",
                Side::Long,
                dec!(0.1),
                20,
                Some(dec!(70000)),
                Some(dec!(60000)),
            ),
        )
        .await
        .unwrap();

    let OrderOutcome::Filled { position, .. } = outcome else {
        panic!("expected fill");
    };
    assert_eq!(position.entry_price, dec!(65011.5005));
    assert_eq!(position.entry_value, dec!(6501.15005));
    assert_eq!(position.margin, dec!(325.0575025));
    assert_eq!(position.entry_fee, dec!(3.250575025));
    assert!(position.liquidation_price < position.entry_price);

    let opened = engine.accounts.snapshot(harness.account_id).await.unwrap();
    assert_eq!(opened.current_balance, dec!(9996.749424975));
    assert_eq!(opened.margin_used, dec!(325.0575025));
    assert_eq!(
        opened.available_margin + opened.margin_used,
        opened.current_balance
    );
    assert_eq!(opened.total_trades, 1);

    // Mid 70105 crosses the 70000 TP; the LONG exits at the derived bid 70097.9895
    engine.process_tick(tick("BTCUSDT", dec!(70100), dec!(70110))).await;

    let trades = harness.repository.trades();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.reason, CloseReason::TakeProfit);
    assert_eq!(trade.exit_price, dec!(70097.9895));
    assert_eq!(trade.gross_pnl, dec!(508.64890));
    assert_eq!(trade.exit_fee, dec!(3.504899475));
    assert_eq!(trade.net_pnl, dec!(505.144000525));

    let closed = engine.accounts.snapshot(harness.account_id).await.unwrap();
    assert_eq!(closed.current_balance, dec!(10501.8934255));
    assert_eq!(closed.available_margin, closed.current_balance);
    assert_eq!(closed.margin_used, Decimal::ZERO);
    assert_eq!(closed.peak_balance, closed.current_balance);
    assert_eq!(closed.winning_trades, 1);

    assert!(engine.positions.is_empty());
    assert_eq!(engine.triggers.entry_count("BTCUSDT"), 0);
    assert!(engine.positions.indexes_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s2_partial_close_scales_position_pro_rata() {
    let harness = harness(dec!(10000), zero_spread()).await;
    let engine = &harness.engine;

    engine.process_tick(tick("ETHUSDT", dec!(3000), dec!(3000))).await;

    let outcome = engine
        .place_order(
            harness.user_id,
            market_order(
                harness.account_id,
                "ETHUSDT",
                Side::Short,
                dec!(2),
                10,
                None,
                None,
            ),
        )
        .await
        .unwrap();
    let OrderOutcome::Filled { position, .. } = outcome else {
        panic!("expected fill");
    };
    assert_eq!(position.entry_price, dec!(3000));
    assert_eq!(position.margin, dec!(600));

    // Market drops to 2900; close a quarter of the position
    engine.process_tick(tick("ETHUSDT", dec!(2900), dec!(2900))).await;
    engine
        .close_position(harness.user_id, position.id, Some(dec!(0.5)))
        .await
        .unwrap();

    let trades = harness.repository.trades();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.gross_pnl, dec!(50.0));
    assert_eq!(trade.exit_fee, dec!(0.7250));
    assert_eq!(trade.net_pnl, dec!(49.2750));

    let remaining = engine.positions.get(position.id).unwrap();
    assert_eq!(remaining.quantity, dec!(1.5));
    assert_eq!(remaining.entry_value, dec!(4500.00));
    assert_eq!(remaining.margin, dec!(450.00));
    assert_eq!(remaining.entry_fee, dec!(2.2500));

    let account = engine.accounts.snapshot(harness.account_id).await.unwrap();
    assert_eq!(account.margin_used, dec!(450.00));
    assert_eq!(
        account.available_margin + account.margin_used,
        account.current_balance
    );
    // Partial closes never move the win/loss counters
    assert_eq!(account.winning_trades, 0);
    assert_eq!(account.losing_trades, 0);

    assert!(engine.positions.indexes_consistent());
    assert_eq!(engine.positions.get_by_account(harness.account_id).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s3_daily_loss_breach_flattens_account() {
    let harness = harness(dec!(10000), zero_spread()).await;
    let engine = &harness.engine;

    engine.process_tick(tick("ETHUSDT", dec!(3000), dec!(3000))).await;

    // A losing LONG about to be closed, plus an unrelated SHORT that the breach must flatten
    let long = match engine
        .place_order(
            harness.user_id,
            market_order(harness.account_id, "ETHUSDT", Side::Long, dec!(1), 10, None, None),
        )
        .await
        .unwrap()
    {
        OrderOutcome::Filled { position, .. } => position,
        other => panic!("expected fill, got {other:?}"),
    };
    engine
        .place_order(
            harness.user_id,
            market_order(harness.account_id, "ETHUSDT", Side::Short, dec!(1), 10, None, None),
        )
        .await
        .unwrap();

    // Day already down 450 against a 500 limit
    {
        let mut locked = engine.accounts.lock(harness.account_id).await.unwrap();
        locked.daily_pnl = dec!(-450);
    }

    // Closing the LONG at 2900 realises roughly -100 and tips the day over the limit
    engine.process_tick(tick("ETHUSDT", dec!(2900), dec!(2900))).await;
    engine
        .close_position(harness.user_id, long.id, None)
        .await
        .unwrap();

    let account = engine.accounts.snapshot(harness.account_id).await.unwrap();
    assert_eq!(account.status, AccountStatus::Breached);
    assert_eq!(account.breach_kind, Some(BreachKind::DailyLoss));
    assert!(account.daily_pnl <= -dec!(500));

    // Every remaining position was closed with reason BREACH
    assert!(engine.positions.is_empty());
    let trades = harness.repository.trades();
    assert_eq!(trades.len(), 2);
    assert!(trades.iter().any(|trade| trade.reason == CloseReason::Manual));
    assert!(trades.iter().any(|trade| trade.reason == CloseReason::Breach));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s4_circuit_breaker_suppresses_triggers() {
    let harness = harness(dec!(10000), zero_spread()).await;
    let engine = &harness.engine;

    engine.process_tick(tick("BTCUSDT", dec!(60000), dec!(60000))).await;

    // TP at 63000 would fire on the spiked tick if the breaker let it through
    let position = match engine
        .place_order(
            harness.user_id,
            market_order(
                harness.account_id,
                "BTCUSDT",
                Side::Long,
                dec!(0.1),
                20,
                Some(dec!(63000)),
                None,
            ),
        )
        .await
        .unwrap()
    {
        OrderOutcome::Filled { position, .. } => position,
        other => panic!("expected fill, got {other:?}"),
    };

    // +5.17% inside the 1000ms window: rejected, breaker trips, no trigger fires
    engine.process_tick(tick("BTCUSDT", dec!(63100), dec!(63100))).await;
    assert!(engine.positions.get(position.id).is_some());
    assert!(engine.prices.is_tripped("BTCUSDT"));

    // Orders meanwhile fail CIRCUIT_OPEN
    let rejection = engine
        .place_order(
            harness.user_id,
            market_order(harness.account_id, "BTCUSDT", Side::Long, dec!(0.1), 20, None, None),
        )
        .await
        .unwrap_err();
    assert_eq!(rejection, OrderRejection::CircuitOpen);

    // Still tripped inside the window
    engine.process_tick(tick("BTCUSDT", dec!(63200), dec!(63200))).await;
    assert!(engine.positions.get(position.id).is_some());

    // After the reset window the next tick is accepted and the TP finally fires
    tokio::time::sleep(Duration::from_millis(1100)).await;
    engine.process_tick(tick("BTCUSDT", dec!(63500), dec!(63500))).await;

    assert!(!engine.prices.is_tripped("BTCUSDT"));
    assert!(engine.positions.get(position.id).is_none());
    let trades = harness.repository.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, CloseReason::TakeProfit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s5_funding_boundary_applies_once() {
    let harness = harness(dec!(10000), zero_spread()).await;
    let engine = &harness.engine;

    engine.process_tick(tick("BTCUSDT", dec!(65000), dec!(65000))).await;
    let position = match engine
        .place_order(
            harness.user_id,
            market_order(harness.account_id, "BTCUSDT", Side::Long, dec!(0.1), 20, None, None),
        )
        .await
        .unwrap()
    {
        OrderOutcome::Filled { position, .. } => position,
        other => panic!("expected fill, got {other:?}"),
    };
    assert_eq!(position.entry_value, dec!(6500.0));

    let boundary = Utc::now() + chrono::TimeDelta::milliseconds(1);
    tokio::time::sleep(Duration::from_millis(5)).await;

    // LONG pays notional · rate = 6500 · 0.0001 = 0.65
    engine.apply_funding_boundary(boundary).await;

    let funded = engine.positions.get(position.id).unwrap();
    assert_eq!(funded.accumulated_funding, dec!(0.65000));
    assert_eq!(funded.last_funding_at, Some(boundary));

    let account = engine.accounts.snapshot(harness.account_id).await.unwrap();
    // 10000 - 3.25 entry fee - 0.65 funding
    assert_eq!(account.current_balance, dec!(9996.10));
    assert_eq!(account.daily_pnl, dec!(-0.65000));

    // Re-applying the same boundary is a no-op
    engine.apply_funding_boundary(boundary).await;
    let account = engine.accounts.snapshot(harness.account_id).await.unwrap();
    assert_eq!(account.current_balance, dec!(9996.10));
    let funded = engine.positions.get(position.id).unwrap();
    assert_eq!(funded.accumulated_funding, dec!(0.65000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s6_rate_limit_fallback_on_cache_outage() {
    let harness = harness(dec!(100000), zero_spread()).await;
    let engine = &harness.engine;

    engine.process_tick(tick("BTCUSDT", dec!(65000), dec!(65000))).await;
    harness.cache.set_failing(true);

    // 12 orders in one second: 10 pass on the local bucket, the rest are RATE_LIMITED
    let mut outcomes = Vec::new();
    for _ in 0..12 {
        outcomes.push(
            engine
                .place_order(
                    harness.user_id,
                    market_order(
                        harness.account_id,
                        "BTCUSDT",
                        Side::Long,
                        dec!(0.001),
                        20,
                        None,
                        None,
                    ),
                )
                .await,
        );
    }

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 10);
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(OrderRejection::RateLimited)))
            .count(),
        2
    );

    // Cache returns: the shared counter takes over again
    harness.cache.set_failing(false);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let outcome = engine
        .place_order(
            harness.user_id,
            market_order(
                harness.account_id,
                "BTCUSDT",
                Side::Long,
                dec!(0.001),
                20,
                None,
                None,
            ),
        )
        .await;
    assert!(outcome.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_order_id_replay_returns_original_outcome() {
    let harness = harness(dec!(10000), zero_spread()).await;
    let engine = &harness.engine;

    engine.process_tick(tick("BTCUSDT", dec!(65000), dec!(65000))).await;

    let mut request = market_order(
        harness.account_id,
        "BTCUSDT",
        Side::Long,
        dec!(0.1),
        20,
        None,
        None,
    );
    request.client_order_id = Some(ClientOrderId::new("ord-1"));

    let first = engine
        .place_order(harness.user_id, request.clone())
        .await
        .unwrap();
    let OrderOutcome::Filled { order_id, position } = first else {
        panic!("expected fill");
    };

    request.timestamp = Utc::now();
    let replay = engine
        .place_order(harness.user_id, request)
        .await
        .unwrap();
    assert_eq!(
        replay,
        OrderOutcome::Duplicate {
            order_id,
            position_id: Some(position.id),
        }
    );

    // No second fill happened
    assert_eq!(engine.positions.len(), 1);
    let account = engine.accounts.snapshot(harness.account_id).await.unwrap();
    assert_eq!(account.total_trades, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn limit_order_reserves_then_fills_when_crossed() {
    let harness = harness(dec!(10000), zero_spread()).await;
    let engine = &harness.engine;

    engine.process_tick(tick("BTCUSDT", dec!(65000), dec!(65000))).await;

    let mut request = market_order(
        harness.account_id,
        "BTCUSDT",
        Side::Long,
        dec!(0.1),
        20,
        None,
        None,
    );
    request.order_type = OrderType::Limit;
    request.limit_price = Some(dec!(64000));

    let outcome = engine
        .place_order(harness.user_id, request)
        .await
        .unwrap();
    assert!(matches!(outcome, OrderOutcome::Accepted { .. }));
    assert_eq!(engine.pending.len(), 1);

    // margin 320 + fee 3.2 reserved at acceptance
    let reserved = engine.accounts.snapshot(harness.account_id).await.unwrap();
    assert_eq!(reserved.available_margin, dec!(9676.8000));
    assert_eq!(reserved.current_balance, dec!(10000));
    assert_eq!(reserved.margin_used, Decimal::ZERO);

    // Market crosses the limit: the resting order fills at the derived ask
    engine.process_tick(tick("BTCUSDT", dec!(63990), dec!(63995))).await;

    assert!(engine.pending.is_empty());
    assert_eq!(engine.positions.len(), 1);
    let position = &engine.positions.get_by_account(harness.account_id)[0];
    assert_eq!(position.entry_price, dec!(63992.5));

    let filled = engine.accounts.snapshot(harness.account_id).await.unwrap();
    assert_eq!(filled.margin_used, position.margin);
    assert_eq!(
        filled.available_margin + filled.margin_used,
        filled.current_balance
    );

    // Idempotence across the retry path: closing a closed position is a no-op
    let close = engine
        .close_position(harness.user_id, position.id, None)
        .await
        .unwrap();
    let second_close = engine
        .close_position(harness.user_id, position.id, None)
        .await
        .unwrap();
    assert!(matches!(
        second_close,
        propel::engine::executor::CloseOutcome::AlreadyClosed
    ));
    drop(close);
    assert_eq!(harness.repository.trades().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_price_rejects_orders() {
    let harness = harness(dec!(10000), zero_spread()).await;
    let engine = &harness.engine;

    let rejection = engine
        .place_order(
            harness.user_id,
            market_order(harness.account_id, "BTCUSDT", Side::Long, dec!(0.1), 20, None, None),
        )
        .await
        .unwrap_err();
    assert_eq!(rejection, OrderRejection::NoPrice);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistence_outage_rolls_back_fill() {
    let harness = harness(dec!(10000), zero_spread()).await;
    let engine = &harness.engine;

    engine.process_tick(tick("BTCUSDT", dec!(65000), dec!(65000))).await;
    harness.repository.set_failing(true);

    let rejection = engine
        .place_order(
            harness.user_id,
            market_order(harness.account_id, "BTCUSDT", Side::Long, dec!(0.1), 20, None, None),
        )
        .await
        .unwrap_err();
    assert_eq!(rejection, OrderRejection::PersistFailed);

    // In-memory state rolled back completely
    assert!(engine.positions.is_empty());
    let account = engine.accounts.snapshot(harness.account_id).await.unwrap();
    assert_eq!(account.current_balance, dec!(10000));
    assert_eq!(account.margin_used, Decimal::ZERO);
    assert_eq!(account.available_margin, dec!(10000));
    assert_eq!(account.total_trades, 0);

    // Store recovers: the same order now fills
    harness.repository.set_failing(false);
    let outcome = engine
        .place_order(
            harness.user_id,
            market_order(harness.account_id, "BTCUSDT", Side::Long, dec!(0.1), 20, None, None),
        )
        .await;
    assert!(outcome.is_ok());
}
