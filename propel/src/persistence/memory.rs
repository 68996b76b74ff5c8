use super::{CloseRecord, DailySnapshot, ExistingFill, FillRecord, Repository};
use crate::{engine::account::Account, error::PersistError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use propel_execution::{
    AccountId, ClientOrderId, OrderId, PositionId, UserId,
    event::TradeEvent,
    order::PendingOrder,
    position::Position,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory [`Repository`] used by tests and local development.
///
/// `fail_transient` simulates a store outage: while set, every write fails with a
/// transient error, exercising the rollback and retry paths.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
    pub fail_transient: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    accounts: FnvHashMap<AccountId, Account>,
    positions: FnvHashMap<PositionId, Position>,
    orders: FnvHashMap<OrderId, StoredOrder>,
    trades: Vec<propel_execution::trade::Trade>,
    events: Vec<TradeEvent>,
    snapshots: Vec<DailySnapshot>,
    sessions: FnvHashMap<String, (UserId, DateTime<Utc>)>,
}

#[derive(Debug, Clone)]
struct StoredOrder {
    account_id: AccountId,
    client_order_id: Option<ClientOrderId>,
    position_id: Option<PositionId>,
    cancelled: bool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account as the external signup flow would.
    pub fn seed_account(&self, account: Account) {
        self.state.lock().accounts.insert(account.id, account);
    }

    /// Seed a bearer-token session.
    pub fn seed_session(&self, token: &str, user_id: UserId, expires_at: DateTime<Utc>) {
        self.state
            .lock()
            .sessions
            .insert(token.to_string(), (user_id, expires_at));
    }

    /// Simulate a store outage for subsequent writes.
    pub fn set_failing(&self, failing: bool) {
        self.fail_transient.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), PersistError> {
        if self.fail_transient.load(Ordering::SeqCst) {
            Err(PersistError::Transient("simulated store outage".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn trades(&self) -> Vec<propel_execution::trade::Trade> {
        self.state.lock().trades.clone()
    }

    pub fn events(&self) -> Vec<TradeEvent> {
        self.state.lock().events.clone()
    }

    pub fn snapshots(&self) -> Vec<DailySnapshot> {
        self.state.lock().snapshots.clone()
    }

    pub fn stored_account(&self, id: AccountId) -> Option<Account> {
        self.state.lock().accounts.get(&id).cloned()
    }

    pub fn stored_position(&self, id: PositionId) -> Option<Position> {
        self.state.lock().positions.get(&id).cloned()
    }

    pub fn order_cancelled(&self, id: OrderId) -> Option<bool> {
        self.state.lock().orders.get(&id).map(|order| order.cancelled)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn load_accounts(&self) -> Result<Vec<Account>, PersistError> {
        Ok(self.state.lock().accounts.values().cloned().collect())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, PersistError> {
        Ok(self.state.lock().positions.values().cloned().collect())
    }

    async fn find_fill_by_client_order_id(
        &self,
        account_id: AccountId,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<ExistingFill>, PersistError> {
        let state = self.state.lock();
        Ok(state.orders.iter().find_map(|(order_id, order)| {
            (order.account_id == account_id
                && order.client_order_id.as_ref() == Some(client_order_id))
            .then_some(ExistingFill {
                order_id: *order_id,
                position_id: order.position_id,
            })
        }))
    }

    async fn persist_fill(&self, record: &FillRecord<'_>) -> Result<(), PersistError> {
        self.check_available()?;
        let mut state = self.state.lock();

        let duplicate = state.orders.values().any(|order| {
            order.account_id == record.account.id
                && order.client_order_id.is_some()
                && order.client_order_id.as_ref() == record.client_order_id
        });
        if duplicate {
            return Err(PersistError::UniqueViolation(
                "orders.client_order_id".to_string(),
            ));
        }

        state
            .positions
            .insert(record.position.id, record.position.clone());
        state.orders.insert(
            record.order_id,
            StoredOrder {
                account_id: record.account.id,
                client_order_id: record.client_order_id.cloned(),
                position_id: Some(record.position.id),
                cancelled: false,
            },
        );
        state.events.push(record.event.clone());
        state.accounts.insert(record.account.id, record.account.clone());
        Ok(())
    }

    async fn persist_limit_fill(&self, record: &FillRecord<'_>) -> Result<(), PersistError> {
        self.check_available()?;
        let mut state = self.state.lock();

        state
            .positions
            .insert(record.position.id, record.position.clone());
        if let Some(order) = state.orders.get_mut(&record.order_id) {
            order.position_id = Some(record.position.id);
        }
        state.events.push(record.event.clone());
        state.accounts.insert(record.account.id, record.account.clone());
        Ok(())
    }

    async fn persist_limit_accept(
        &self,
        order: &PendingOrder,
        account: &Account,
        event: &TradeEvent,
    ) -> Result<(), PersistError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.orders.insert(
            order.id,
            StoredOrder {
                account_id: order.account_id,
                client_order_id: order.client_order_id.clone(),
                position_id: None,
                cancelled: false,
            },
        );
        state.events.push(event.clone());
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn persist_limit_cancel(
        &self,
        order_id: OrderId,
        account: &Account,
        event: &TradeEvent,
    ) -> Result<(), PersistError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.cancelled = true;
        }
        state.events.push(event.clone());
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn persist_close(&self, record: &CloseRecord<'_>) -> Result<(), PersistError> {
        self.check_available()?;
        let mut state = self.state.lock();

        // Idempotence guard: the close transaction keys on the open position row
        if !state.positions.contains_key(&record.trade.position_id) {
            return Err(PersistError::NotFound(format!(
                "position {}",
                record.trade.position_id
            )));
        }

        state.trades.push(record.trade.clone());
        state.events.push(record.event.clone());
        match record.remaining {
            Some(remaining) => {
                state.positions.insert(remaining.id, remaining.clone());
            }
            None => {
                state.positions.remove(&record.trade.position_id);
            }
        }
        state.accounts.insert(record.account.id, record.account.clone());
        Ok(())
    }

    async fn update_account(&self, account: &Account) -> Result<(), PersistError> {
        self.check_available()?;
        self.state.lock().accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn update_position(&self, position: &Position) -> Result<(), PersistError> {
        self.check_available()?;
        self.state
            .lock()
            .positions
            .insert(position.id, position.clone());
        Ok(())
    }

    async fn append_event(&self, event: &TradeEvent) -> Result<(), PersistError> {
        self.check_available()?;
        self.state.lock().events.push(event.clone());
        Ok(())
    }

    async fn insert_daily_snapshot(&self, snapshot: &DailySnapshot) -> Result<(), PersistError> {
        self.check_available()?;
        self.state.lock().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn validate_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserId>, PersistError> {
        let state = self.state.lock();
        Ok(state
            .sessions
            .get(token)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(user_id, _)| *user_id))
    }
}
