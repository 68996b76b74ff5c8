use crate::{engine::account::Account, error::PersistError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use propel_execution::{
    AccountId, ClientOrderId, OrderId, PositionId, UserId,
    event::TradeEvent,
    order::PendingOrder,
    position::Position,
    trade::Trade,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// In-memory repository double used by tests and local development.
pub mod memory;

/// Postgres-backed repository, the production store of record.
pub mod postgres;

/// Everything written atomically when a market/limit order fills.
#[derive(Debug)]
pub struct FillRecord<'a> {
    pub position: &'a Position,
    pub order_id: OrderId,
    pub client_order_id: Option<&'a ClientOrderId>,
    pub account: &'a Account,
    pub event: &'a TradeEvent,
}

/// Everything written atomically when a position (slice) closes.
#[derive(Debug)]
pub struct CloseRecord<'a> {
    pub trade: &'a Trade,
    /// Remaining position after a partial close; `None` deletes the position row.
    pub remaining: Option<&'a Position>,
    pub account: &'a Account,
    pub event: &'a TradeEvent,
}

/// End-of-day account snapshot written by the daily reset worker.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DailySnapshot {
    pub account_id: AccountId,
    pub snapshot_date: NaiveDate,
    pub starting_balance: Decimal,
    pub ending_balance: Decimal,
    pub peak_balance: Decimal,
    pub daily_pnl: Decimal,
    /// Peak-to-current drawdown at snapshot time.
    pub drawdown: Decimal,
    pub trades_closed: u32,
    pub volume: Decimal,
}

/// Previously-settled fill found by a `client_order_id` idempotency lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingFill {
    pub order_id: OrderId,
    pub position_id: Option<PositionId>,
}

/// Store-of-record interface used by the engine core.
///
/// The fill/close writes are single transactions: either every row lands or none does.
/// Implementations apply the engine deadline (2s) internally and surface expiry as
/// [`PersistError::Timeout`].
#[async_trait]
pub trait Repository: Send + Sync {
    /// Accounts relevant to engine operation (tradeable status or open positions).
    async fn load_accounts(&self) -> Result<Vec<Account>, PersistError>;

    /// All open positions, loaded at startup to rebuild in-memory state.
    async fn load_open_positions(&self) -> Result<Vec<Position>, PersistError>;

    /// Idempotency lookup: an order previously settled under this client order id.
    async fn find_fill_by_client_order_id(
        &self,
        account_id: AccountId,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<ExistingFill>, PersistError>;

    /// Atomically persist an order fill: position row, order row (filled), audit event and
    /// the updated account.
    async fn persist_fill(&self, record: &FillRecord<'_>) -> Result<(), PersistError>;

    /// Atomically persist a previously-accepted limit order filling: position row insert,
    /// order row update to filled, audit event and the updated account.
    async fn persist_limit_fill(&self, record: &FillRecord<'_>) -> Result<(), PersistError>;

    /// Persist an accepted (unfilled) limit order and the account's margin reservation.
    async fn persist_limit_accept(
        &self,
        order: &PendingOrder,
        account: &Account,
        event: &TradeEvent,
    ) -> Result<(), PersistError>;

    /// Mark a pending order cancelled/expired and persist the released reservation.
    async fn persist_limit_cancel(
        &self,
        order_id: OrderId,
        account: &Account,
        event: &TradeEvent,
    ) -> Result<(), PersistError>;

    /// Atomically persist a close: trade row, audit event, position delete/update and the
    /// updated account.
    async fn persist_close(&self, record: &CloseRecord<'_>) -> Result<(), PersistError>;

    /// Write-behind account flush.
    async fn update_account(&self, account: &Account) -> Result<(), PersistError>;

    /// Update a position's mutable fields (TP/SL edits, funding accrual).
    async fn update_position(&self, position: &Position) -> Result<(), PersistError>;

    /// Append-only audit event outside a fill/close transaction.
    async fn append_event(&self, event: &TradeEvent) -> Result<(), PersistError>;

    /// End-of-day snapshot row.
    async fn insert_daily_snapshot(&self, snapshot: &DailySnapshot) -> Result<(), PersistError>;

    /// Resolve a bearer token to its user, honouring the session expiry.
    async fn validate_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserId>, PersistError>;
}
