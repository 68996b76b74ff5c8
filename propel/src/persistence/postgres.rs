use super::{CloseRecord, DailySnapshot, ExistingFill, FillRecord, Repository};
use crate::{
    engine::account::{Account, AccountStatus, BreachKind, EvaluationPlan, PlanKind},
    error::PersistError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use propel_execution::{
    AccountId, ClientOrderId, OrderId, PositionId, Side, UserId,
    event::TradeEvent,
    order::PendingOrder,
    position::Position,
};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use sqlx::{PgPool, Row, postgres::PgRow};
use std::{future::Future, time::Duration};
use uuid::Uuid;

/// Engine deadline for any single store round trip.
const DB_DEADLINE: Duration = Duration::from_secs(2);

/// Postgres-backed [`Repository`]. Fill and close writes run in single transactions; every
/// call is bounded by [`DB_DEADLINE`] and surfaces expiry as [`PersistError::Timeout`].
#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, PersistError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(PersistError::from)?;
        Ok(Self::new(pool))
    }

    async fn with_deadline<T, F>(fut: F) -> Result<T, PersistError>
    where
        F: Future<Output = Result<T, PersistError>>,
    {
        tokio::time::timeout(DB_DEADLINE, fut)
            .await
            .map_err(|_| PersistError::Timeout(DB_DEADLINE.as_millis() as u64))?
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    }
}

fn side_from_str(raw: &str) -> Side {
    match raw {
        "SHORT" => Side::Short,
        _ => Side::Long,
    }
}

fn status_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::PendingPayment => "pending_payment",
        AccountStatus::Active => "active",
        AccountStatus::Step1Passed => "step1_passed",
        AccountStatus::Passed => "passed",
        AccountStatus::Breached => "breached",
        AccountStatus::Expired => "expired",
        AccountStatus::Suspended => "suspended",
    }
}

fn status_from_str(raw: &str) -> AccountStatus {
    match raw {
        "pending_payment" => AccountStatus::PendingPayment,
        "step1_passed" => AccountStatus::Step1Passed,
        "passed" => AccountStatus::Passed,
        "breached" => AccountStatus::Breached,
        "expired" => AccountStatus::Expired,
        "suspended" => AccountStatus::Suspended,
        _ => AccountStatus::Active,
    }
}

fn breach_str(kind: BreachKind) -> &'static str {
    match kind {
        BreachKind::DailyLoss => "daily_loss",
        BreachKind::MaxDrawdown => "max_drawdown",
        BreachKind::Admin => "admin",
    }
}

fn breach_from_str(raw: &str) -> BreachKind {
    match raw {
        "max_drawdown" => BreachKind::MaxDrawdown,
        "admin" => BreachKind::Admin,
        _ => BreachKind::DailyLoss,
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, sqlx::Error> {
    let plan_kind: String = row.try_get("plan_kind")?;
    let status: String = row.try_get("status")?;
    let breach_kind: Option<String> = row.try_get("breach_type")?;
    let account_number: String = row.try_get("account_number")?;

    Ok(Account {
        id: AccountId(row.try_get::<Uuid, _>("id")?),
        user_id: UserId(row.try_get::<Uuid, _>("user_id")?),
        account_number: SmolStr::new(account_number),
        status: status_from_str(&status),
        breach_kind: breach_kind.as_deref().map(breach_from_str),
        evaluation_step: row.try_get::<i16, _>("evaluation_step")? as u8,
        plan: EvaluationPlan {
            kind: if plan_kind == "two_step" {
                PlanKind::TwoStep
            } else {
                PlanKind::OneStep
            },
            btc_eth_max_leverage: row.try_get::<i32, _>("btc_eth_max_leverage")? as u32,
            altcoin_max_leverage: row.try_get::<i32, _>("altcoin_max_leverage")? as u32,
            profit_split_pct: row.try_get("profit_split_pct")?,
            min_trading_days: row.try_get::<i32, _>("min_trading_days")? as u32,
        },
        starting_balance: row.try_get("starting_balance")?,
        current_balance: row.try_get("current_balance")?,
        peak_balance: row.try_get("peak_balance")?,
        margin_used: row.try_get("margin_used")?,
        available_margin: row.try_get("available_margin")?,
        reserved_margin: row.try_get("reserved_margin")?,
        daily_starting_balance: row.try_get("daily_starting_balance")?,
        daily_pnl: row.try_get("daily_pnl")?,
        daily_reset_at: row.try_get("daily_reset_at")?,
        daily_loss_limit: row.try_get("daily_loss_limit")?,
        max_drawdown_limit: row.try_get("max_drawdown_limit")?,
        profit_target: row.try_get("profit_target")?,
        trading_days: row.try_get::<i32, _>("trading_days")? as u32,
        total_trades: row.try_get::<i32, _>("total_trades")? as u32,
        winning_trades: row.try_get::<i32, _>("winning_trades")? as u32,
        losing_trades: row.try_get::<i32, _>("losing_trades")? as u32,
        closed_today: row.try_get("closed_today")?,
        daily_trades: row.try_get::<i32, _>("daily_trades")? as u32,
        daily_volume: row.try_get("daily_volume")?,
        last_trade_at: row.try_get("last_trade_at")?,
    })
}

fn position_from_row(row: &PgRow) -> Result<Position, sqlx::Error> {
    let side: String = row.try_get("side")?;
    let symbol: String = row.try_get("symbol")?;

    Ok(Position {
        id: PositionId(row.try_get::<Uuid, _>("id")?),
        account_id: AccountId(row.try_get::<Uuid, _>("account_id")?),
        symbol: SmolStr::new(symbol),
        side: side_from_str(&side),
        quantity: row.try_get("quantity")?,
        leverage: row.try_get::<i32, _>("leverage")? as u32,
        entry_price: row.try_get("entry_price")?,
        entry_value: row.try_get("entry_value")?,
        margin: row.try_get("margin_used")?,
        entry_fee: row.try_get("entry_fee")?,
        take_profit: row.try_get("take_profit")?,
        stop_loss: row.try_get("stop_loss")?,
        liquidation_price: row.try_get("liquidation_price")?,
        current_price: row.try_get("entry_price")?,
        unrealized_pnl: Decimal::ZERO,
        entry_reference_price: row.try_get("entry_reference_price")?,
        accumulated_funding: row.try_get("accumulated_funding")?,
        last_funding_at: row.try_get("last_funding_at")?,
        opened_at: row.try_get("opened_at")?,
    })
}

const UPDATE_ACCOUNT_SQL: &str = r#"
    UPDATE trading_accounts SET
        status = $2, breach_type = $3, evaluation_step = $4,
        current_balance = $5, peak_balance = $6, margin_used = $7, available_margin = $8,
        reserved_margin = $9, daily_starting_balance = $10, daily_pnl = $11,
        daily_reset_at = $12, trading_days = $13, total_trades = $14, winning_trades = $15,
        losing_trades = $16, closed_today = $17, daily_trades = $18, daily_volume = $19,
        last_trade_at = $20, updated_at = NOW()
    WHERE id = $1
"#;

async fn exec_update_account<'e, E>(executor: E, account: &Account) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(UPDATE_ACCOUNT_SQL)
        .bind(account.id.0)
        .bind(status_str(account.status))
        .bind(account.breach_kind.map(breach_str))
        .bind(account.evaluation_step as i16)
        .bind(account.current_balance)
        .bind(account.peak_balance)
        .bind(account.margin_used)
        .bind(account.available_margin)
        .bind(account.reserved_margin)
        .bind(account.daily_starting_balance)
        .bind(account.daily_pnl)
        .bind(account.daily_reset_at)
        .bind(account.trading_days as i32)
        .bind(account.total_trades as i32)
        .bind(account.winning_trades as i32)
        .bind(account.losing_trades as i32)
        .bind(account.closed_today)
        .bind(account.daily_trades as i32)
        .bind(account.daily_volume)
        .bind(account.last_trade_at)
        .execute(executor)
        .await
        .map(|_| ())
}

const INSERT_EVENT_SQL: &str = r#"
    INSERT INTO trade_events
        (id, account_id, event_type, position_id, trade_id, details, event_hash, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

async fn exec_insert_event<'e, E>(executor: E, event: &TradeEvent) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let event_type =
        serde_json::to_value(event.kind).expect("TradeEventKind is always serialisable");

    sqlx::query(INSERT_EVENT_SQL)
        .bind(event.id)
        .bind(event.account_id.0)
        .bind(event_type.as_str().unwrap_or_default().to_string())
        .bind(event.position_id.map(|id| id.0))
        .bind(event.trade_id.map(|id| id.0))
        .bind(&event.details)
        .bind(&event.event_hash)
        .bind(event.created_at)
        .execute(executor)
        .await
        .map(|_| ())
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn load_accounts(&self) -> Result<Vec<Account>, PersistError> {
        Self::with_deadline(async {
            let rows = sqlx::query(
                r#"
                SELECT a.*, p.kind AS plan_kind, p.btc_eth_max_leverage, p.altcoin_max_leverage,
                       p.profit_split_pct, p.min_trading_days
                FROM trading_accounts a
                JOIN evaluation_plans p ON p.id = a.plan_id
                WHERE a.status IN ('active', 'step1_passed')
                   OR a.id IN (SELECT DISTINCT account_id FROM positions)
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(PersistError::from)?;

            rows.iter()
                .map(|row| account_from_row(row).map_err(PersistError::from))
                .collect()
        })
        .await
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, PersistError> {
        Self::with_deadline(async {
            let rows = sqlx::query("SELECT * FROM positions")
                .fetch_all(&self.pool)
                .await
                .map_err(PersistError::from)?;

            rows.iter()
                .map(|row| position_from_row(row).map_err(PersistError::from))
                .collect()
        })
        .await
    }

    async fn find_fill_by_client_order_id(
        &self,
        account_id: AccountId,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<ExistingFill>, PersistError> {
        Self::with_deadline(async {
            let row = sqlx::query(
                "SELECT id, position_id FROM orders WHERE account_id = $1 AND client_order_id = $2",
            )
            .bind(account_id.0)
            .bind(client_order_id.0.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(PersistError::from)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let order_id = OrderId(
                row.try_get::<Uuid, _>("id")
                    .map_err(PersistError::from)?,
            );
            let position_id = row
                .try_get::<Option<Uuid>, _>("position_id")
                .map_err(PersistError::from)?
                .map(PositionId);

            Ok(Some(ExistingFill {
                order_id,
                position_id,
            }))
        })
        .await
    }

    async fn persist_fill(&self, record: &FillRecord<'_>) -> Result<(), PersistError> {
        Self::with_deadline(async {
            let mut tx = self.pool.begin().await.map_err(PersistError::from)?;
            let position = record.position;

            sqlx::query(
                r#"
                INSERT INTO positions
                    (id, account_id, symbol, side, quantity, leverage, entry_price, entry_value,
                     margin_used, entry_fee, take_profit, stop_loss, liquidation_price,
                     entry_reference_price, accumulated_funding, last_funding_at, opened_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
                "#,
            )
            .bind(position.id.0)
            .bind(position.account_id.0)
            .bind(position.symbol.as_str())
            .bind(side_str(position.side))
            .bind(position.quantity)
            .bind(position.leverage as i32)
            .bind(position.entry_price)
            .bind(position.entry_value)
            .bind(position.margin)
            .bind(position.entry_fee)
            .bind(position.take_profit)
            .bind(position.stop_loss)
            .bind(position.liquidation_price)
            .bind(position.entry_reference_price)
            .bind(position.accumulated_funding)
            .bind(position.last_funding_at)
            .bind(position.opened_at)
            .execute(&mut *tx)
            .await
            .map_err(PersistError::from)?;

            sqlx::query(
                r#"
                INSERT INTO orders
                    (id, account_id, symbol, side, order_type, status, quantity, leverage,
                     position_id, client_order_id, created_at, filled_at)
                VALUES ($1,$2,$3,$4,'MARKET','filled',$5,$6,$7,$8,$9,$9)
                "#,
            )
            .bind(record.order_id.0)
            .bind(position.account_id.0)
            .bind(position.symbol.as_str())
            .bind(side_str(position.side))
            .bind(position.quantity)
            .bind(position.leverage as i32)
            .bind(position.id.0)
            .bind(record.client_order_id.map(|id| id.0.as_str()))
            .bind(position.opened_at)
            .execute(&mut *tx)
            .await
            .map_err(PersistError::from)?;

            exec_insert_event(&mut *tx, record.event)
                .await
                .map_err(PersistError::from)?;
            exec_update_account(&mut *tx, record.account)
                .await
                .map_err(PersistError::from)?;

            tx.commit().await.map_err(PersistError::from)
        })
        .await
    }

    async fn persist_limit_fill(&self, record: &FillRecord<'_>) -> Result<(), PersistError> {
        Self::with_deadline(async {
            let mut tx = self.pool.begin().await.map_err(PersistError::from)?;
            let position = record.position;

            sqlx::query(
                r#"
                INSERT INTO positions
                    (id, account_id, symbol, side, quantity, leverage, entry_price, entry_value,
                     margin_used, entry_fee, take_profit, stop_loss, liquidation_price,
                     entry_reference_price, accumulated_funding, last_funding_at, opened_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
                "#,
            )
            .bind(position.id.0)
            .bind(position.account_id.0)
            .bind(position.symbol.as_str())
            .bind(side_str(position.side))
            .bind(position.quantity)
            .bind(position.leverage as i32)
            .bind(position.entry_price)
            .bind(position.entry_value)
            .bind(position.margin)
            .bind(position.entry_fee)
            .bind(position.take_profit)
            .bind(position.stop_loss)
            .bind(position.liquidation_price)
            .bind(position.entry_reference_price)
            .bind(position.accumulated_funding)
            .bind(position.last_funding_at)
            .bind(position.opened_at)
            .execute(&mut *tx)
            .await
            .map_err(PersistError::from)?;

            sqlx::query(
                "UPDATE orders SET status = 'filled', position_id = $2, filled_at = $3 WHERE id = $1",
            )
            .bind(record.order_id.0)
            .bind(position.id.0)
            .bind(position.opened_at)
            .execute(&mut *tx)
            .await
            .map_err(PersistError::from)?;

            exec_insert_event(&mut *tx, record.event)
                .await
                .map_err(PersistError::from)?;
            exec_update_account(&mut *tx, record.account)
                .await
                .map_err(PersistError::from)?;

            tx.commit().await.map_err(PersistError::from)
        })
        .await
    }

    async fn persist_limit_accept(
        &self,
        order: &PendingOrder,
        account: &Account,
        event: &TradeEvent,
    ) -> Result<(), PersistError> {
        Self::with_deadline(async {
            let mut tx = self.pool.begin().await.map_err(PersistError::from)?;

            sqlx::query(
                r#"
                INSERT INTO orders
                    (id, account_id, symbol, side, order_type, status, quantity, leverage,
                     limit_price, take_profit, stop_loss, reserved_margin, client_order_id,
                     expires_at, created_at)
                VALUES ($1,$2,$3,$4,'LIMIT','pending',$5,$6,$7,$8,$9,$10,$11,$12,$13)
                "#,
            )
            .bind(order.id.0)
            .bind(order.account_id.0)
            .bind(order.symbol.as_str())
            .bind(side_str(order.side))
            .bind(order.quantity)
            .bind(order.leverage as i32)
            .bind(order.limit_price)
            .bind(order.take_profit)
            .bind(order.stop_loss)
            .bind(order.reserved)
            .bind(order.client_order_id.as_ref().map(|id| id.0.as_str()))
            .bind(order.expires_at)
            .bind(order.created_at)
            .execute(&mut *tx)
            .await
            .map_err(PersistError::from)?;

            exec_insert_event(&mut *tx, event)
                .await
                .map_err(PersistError::from)?;
            exec_update_account(&mut *tx, account)
                .await
                .map_err(PersistError::from)?;

            tx.commit().await.map_err(PersistError::from)
        })
        .await
    }

    async fn persist_limit_cancel(
        &self,
        order_id: OrderId,
        account: &Account,
        event: &TradeEvent,
    ) -> Result<(), PersistError> {
        Self::with_deadline(async {
            let mut tx = self.pool.begin().await.map_err(PersistError::from)?;

            sqlx::query(
                "UPDATE orders SET status = 'cancelled', cancelled_at = NOW() WHERE id = $1",
            )
            .bind(order_id.0)
            .execute(&mut *tx)
            .await
            .map_err(PersistError::from)?;

            exec_insert_event(&mut *tx, event)
                .await
                .map_err(PersistError::from)?;
            exec_update_account(&mut *tx, account)
                .await
                .map_err(PersistError::from)?;

            tx.commit().await.map_err(PersistError::from)
        })
        .await
    }

    async fn persist_close(&self, record: &CloseRecord<'_>) -> Result<(), PersistError> {
        Self::with_deadline(async {
            let mut tx = self.pool.begin().await.map_err(PersistError::from)?;
            let trade = record.trade;

            sqlx::query(
                r#"
                INSERT INTO trades
                    (id, position_id, account_id, symbol, side, quantity, leverage,
                     entry_price, exit_price, entry_value, exit_value, entry_fee, exit_fee,
                     gross_pnl, net_pnl, close_reason, entry_reference_price,
                     exit_reference_price, opened_at, closed_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)
                "#,
            )
            .bind(trade.id.0)
            .bind(trade.position_id.0)
            .bind(trade.account_id.0)
            .bind(trade.symbol.as_str())
            .bind(side_str(trade.side))
            .bind(trade.quantity)
            .bind(trade.leverage as i32)
            .bind(trade.entry_price)
            .bind(trade.exit_price)
            .bind(trade.entry_value)
            .bind(trade.exit_value)
            .bind(trade.entry_fee)
            .bind(trade.exit_fee)
            .bind(trade.gross_pnl)
            .bind(trade.net_pnl)
            .bind(
                serde_json::to_value(trade.reason)
                    .ok()
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_else(|| "MANUAL".to_string()),
            )
            .bind(trade.entry_reference_price)
            .bind(trade.exit_reference_price)
            .bind(trade.opened_at)
            .bind(trade.closed_at)
            .execute(&mut *tx)
            .await
            .map_err(PersistError::from)?;

            exec_insert_event(&mut *tx, record.event)
                .await
                .map_err(PersistError::from)?;

            // Unlink any limit orders that pointed at the closed position
            sqlx::query("UPDATE orders SET position_id = NULL WHERE position_id = $1")
                .bind(trade.position_id.0)
                .execute(&mut *tx)
                .await
                .map_err(PersistError::from)?;

            match record.remaining {
                Some(remaining) => {
                    sqlx::query(
                        r#"
                        UPDATE positions SET
                            quantity = $2, entry_value = $3, margin_used = $4, entry_fee = $5,
                            take_profit = $6, stop_loss = $7, accumulated_funding = $8,
                            last_funding_at = $9
                        WHERE id = $1
                        "#,
                    )
                    .bind(remaining.id.0)
                    .bind(remaining.quantity)
                    .bind(remaining.entry_value)
                    .bind(remaining.margin)
                    .bind(remaining.entry_fee)
                    .bind(remaining.take_profit)
                    .bind(remaining.stop_loss)
                    .bind(remaining.accumulated_funding)
                    .bind(remaining.last_funding_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(PersistError::from)?;
                }
                None => {
                    let deleted = sqlx::query("DELETE FROM positions WHERE id = $1")
                        .bind(trade.position_id.0)
                        .execute(&mut *tx)
                        .await
                        .map_err(PersistError::from)?;

                    // Already-deleted position: a concurrent settle won; abort rather than
                    // double-append the trade
                    if deleted.rows_affected() == 0 {
                        return Err(PersistError::NotFound(format!(
                            "position {}",
                            trade.position_id
                        )));
                    }
                }
            }

            exec_update_account(&mut *tx, record.account)
                .await
                .map_err(PersistError::from)?;

            tx.commit().await.map_err(PersistError::from)
        })
        .await
    }

    async fn update_account(&self, account: &Account) -> Result<(), PersistError> {
        Self::with_deadline(async {
            exec_update_account(&self.pool, account)
                .await
                .map_err(PersistError::from)
        })
        .await
    }

    async fn update_position(&self, position: &Position) -> Result<(), PersistError> {
        Self::with_deadline(async {
            sqlx::query(
                r#"
                UPDATE positions SET
                    take_profit = $2, stop_loss = $3, accumulated_funding = $4,
                    last_funding_at = $5
                WHERE id = $1
                "#,
            )
            .bind(position.id.0)
            .bind(position.take_profit)
            .bind(position.stop_loss)
            .bind(position.accumulated_funding)
            .bind(position.last_funding_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistError::from)
        })
        .await
    }

    async fn append_event(&self, event: &TradeEvent) -> Result<(), PersistError> {
        Self::with_deadline(async {
            exec_insert_event(&self.pool, event)
                .await
                .map_err(PersistError::from)
        })
        .await
    }

    async fn insert_daily_snapshot(&self, snapshot: &DailySnapshot) -> Result<(), PersistError> {
        Self::with_deadline(async {
            sqlx::query(
                r#"
                INSERT INTO daily_snapshots
                    (account_id, snapshot_date, starting_balance, ending_balance, peak_balance,
                     daily_pnl, drawdown, trades_closed, volume)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                ON CONFLICT (account_id, snapshot_date) DO NOTHING
                "#,
            )
            .bind(snapshot.account_id.0)
            .bind(snapshot.snapshot_date)
            .bind(snapshot.starting_balance)
            .bind(snapshot.ending_balance)
            .bind(snapshot.peak_balance)
            .bind(snapshot.daily_pnl)
            .bind(snapshot.drawdown)
            .bind(snapshot.trades_closed as i32)
            .bind(snapshot.volume)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistError::from)
        })
        .await
    }

    async fn validate_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserId>, PersistError> {
        Self::with_deadline(async {
            let row = sqlx::query(
                "SELECT user_id FROM sessions WHERE token = $1 AND expires_at > $2",
            )
            .bind(token)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(PersistError::from)?;

            row.map(|row| {
                row.try_get::<Uuid, _>("user_id")
                    .map(UserId)
                    .map_err(PersistError::from)
            })
            .transpose()
        })
        .await
    }
}
