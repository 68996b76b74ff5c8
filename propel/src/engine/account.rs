use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::RwLock;
use propel_execution::{AccountId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;
use tracing::info;

/// Lifecycle status of an evaluation account.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    PendingPayment,
    Active,
    Step1Passed,
    Passed,
    Breached,
    Expired,
    Suspended,
}

impl AccountStatus {
    /// Whether orders may be placed on an account in this status.
    pub fn can_trade(&self) -> bool {
        matches!(self, AccountStatus::Active | AccountStatus::Step1Passed)
    }
}

/// Which risk rule breached an account.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BreachKind {
    DailyLoss,
    MaxDrawdown,
    Admin,
}

/// Evaluation programme shape the account was sold under.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    OneStep,
    TwoStep,
}

/// Plan parameters fixed at purchase.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EvaluationPlan {
    pub kind: PlanKind,
    pub btc_eth_max_leverage: u32,
    pub altcoin_max_leverage: u32,
    pub profit_split_pct: Decimal,
    pub min_trading_days: u32,
}

/// Authoritative in-memory state of a trading account.
///
/// Invariants (§ after every completed operation):
/// * `available_margin + margin_used = current_balance`
/// * `peak_balance` is monotone non-decreasing
/// * `current_balance ≥ 0` or the account is breached
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub account_number: SmolStr,
    pub status: AccountStatus,
    pub breach_kind: Option<BreachKind>,
    /// 1-indexed evaluation step for two-step plans.
    pub evaluation_step: u8,
    pub plan: EvaluationPlan,

    pub starting_balance: Decimal,
    pub current_balance: Decimal,
    pub peak_balance: Decimal,
    pub margin_used: Decimal,
    pub available_margin: Decimal,
    /// Margin + fees held for accepted-but-unfilled limit orders.
    pub reserved_margin: Decimal,

    pub daily_starting_balance: Decimal,
    pub daily_pnl: Decimal,
    pub daily_reset_at: DateTime<Utc>,

    pub daily_loss_limit: Decimal,
    pub max_drawdown_limit: Decimal,
    pub profit_target: Decimal,

    pub trading_days: u32,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Whether any close settled since the previous daily reset.
    pub closed_today: bool,
    /// Closes settled since the previous daily reset.
    pub daily_trades: u32,
    /// Notional traded (fills + closes) since the previous daily reset.
    pub daily_volume: Decimal,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Leverage ceiling for the provided symbol under this account's plan.
    pub fn max_leverage(&self, symbol: &str) -> u32 {
        if crate::config::is_major(symbol) {
            self.plan.btc_eth_max_leverage
        } else {
            self.plan.altcoin_max_leverage
        }
    }

    /// Realised profit relative to the step's starting balance.
    pub fn current_profit(&self) -> Decimal {
        self.current_balance - self.starting_balance
    }

    fn recompute_available(&mut self) {
        self.available_margin = self.current_balance - self.margin_used - self.reserved_margin;
    }

    /// Apply a market/limit fill that was funded from free margin: debit the entry fee,
    /// lock the initial margin and bump trade counters.
    pub fn apply_order_fill(
        &mut self,
        notional: Decimal,
        margin: Decimal,
        entry_fee: Decimal,
        now: DateTime<Utc>,
    ) {
        self.current_balance -= entry_fee;
        self.margin_used += margin;
        self.recompute_available();
        self.total_trades += 1;
        self.daily_volume += notional;
        self.last_trade_at = Some(now);
    }

    /// Reserve margin + fee for an accepted limit order. Released on cancel/expiry, or
    /// converted by [`Account::apply_order_fill`] after [`Account::release_reservation`]
    /// at fill time.
    pub fn reserve(&mut self, amount: Decimal) {
        self.reserved_margin += amount;
        self.recompute_available();
    }

    /// Release a limit-order reservation.
    pub fn release_reservation(&mut self, amount: Decimal) {
        self.reserved_margin -= amount;
        self.recompute_available();
    }

    /// Settle a close: credit net PnL, release the margin slice and update counters.
    ///
    /// Win/loss counters move on full closes only.
    pub fn apply_close(
        &mut self,
        full_close: bool,
        net_pnl: Decimal,
        margin_released: Decimal,
        exit_value: Decimal,
        now: DateTime<Utc>,
    ) {
        self.current_balance += net_pnl;
        self.margin_used -= margin_released;
        self.recompute_available();
        self.daily_pnl += net_pnl;
        self.closed_today = true;
        self.daily_trades += 1;
        self.daily_volume += exit_value;
        self.last_trade_at = Some(now);

        if self.current_balance > self.peak_balance {
            self.peak_balance = self.current_balance;
        }

        if full_close {
            if net_pnl > Decimal::ZERO {
                self.winning_trades += 1;
            } else {
                self.losing_trades += 1;
            }
        }
    }

    /// Apply a funding cost (positive = account pays, negative = account receives).
    pub fn apply_funding(&mut self, cost: Decimal) {
        self.current_balance -= cost;
        self.daily_pnl -= cost;
        self.recompute_available();
    }

    /// Roll the account over its daily UTC boundary.
    ///
    /// `trading_days` increments iff there was activity (non-zero daily PnL or a close)
    /// since the previous reset.
    pub fn reset_daily(&mut self, next_reset_at: DateTime<Utc>) {
        if self.daily_pnl != Decimal::ZERO || self.closed_today {
            self.trading_days += 1;
        }
        self.daily_starting_balance = self.current_balance;
        self.daily_pnl = Decimal::ZERO;
        self.closed_today = false;
        self.daily_trades = 0;
        self.daily_volume = Decimal::ZERO;
        self.daily_reset_at = next_reset_at;
    }

    /// Transition the account's lifecycle status.
    pub fn transition_status(&mut self, status: AccountStatus, breach_kind: Option<BreachKind>) {
        info!(
            account = %self.id,
            from = ?self.status,
            to = ?status,
            ?breach_kind,
            "account status transition"
        );
        self.status = status;
        self.breach_kind = breach_kind;
    }
}

/// Client-facing account snapshot carried on `ACCOUNT_UPDATED` and close events.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AccountSummary {
    pub id: AccountId,
    pub status: AccountStatus,
    pub current_balance: Decimal,
    pub available_margin: Decimal,
    pub margin_used: Decimal,
    pub peak_balance: Decimal,
    pub daily_pnl: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
}

impl From<&Account> for AccountSummary {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            status: account.status,
            current_balance: account.current_balance,
            available_margin: account.available_margin,
            margin_used: account.margin_used,
            peak_balance: account.peak_balance,
            daily_pnl: account.daily_pnl,
            total_trades: account.total_trades,
            winning_trades: account.winning_trades,
            losing_trades: account.losing_trades,
        }
    }
}

/// Authoritative in-memory store of accounts with per-account mutual exclusion and
/// write-behind dirty tracking.
///
/// Every mutation passes through the per-account `tokio::sync::Mutex` (FIFO-fair), which is
/// held across persistence awaits so a store outage blocks that account's mutations without
/// deadlocking others. Readers take brief locks and clone.
#[derive(Debug, Default)]
pub struct AccountManager {
    entries: RwLock<FnvHashMap<AccountId, Arc<tokio::sync::Mutex<Account>>>>,
    by_user: RwLock<FnvHashMap<UserId, Vec<AccountId>>>,
    dirty: parking_lot::Mutex<FnvHashSet<AccountId>>,
    dirty_notify: tokio::sync::Notify,
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account loaded from the store of record.
    pub fn insert(&self, account: Account) {
        let (id, user_id) = (account.id, account.user_id);
        self.entries
            .write()
            .insert(id, Arc::new(tokio::sync::Mutex::new(account)));

        let mut by_user = self.by_user.write();
        let ids = by_user.entry(user_id).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    /// Accounts owned by the user. Session registration uses this to scope fan-out.
    pub fn ids_for_user(&self, user_id: UserId) -> Vec<AccountId> {
        self.by_user
            .read()
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Acquire the per-account lock, serialising all mutations on that account.
    pub async fn lock(&self, id: AccountId) -> Option<tokio::sync::OwnedMutexGuard<Account>> {
        let entry = self.entries.read().get(&id).cloned()?;
        Some(entry.lock_owned().await)
    }

    /// Consistent snapshot of an account (brief lock + clone).
    pub async fn snapshot(&self, id: AccountId) -> Option<Account> {
        let entry = self.entries.read().get(&id).cloned()?;
        let snapshot = entry.lock().await.clone();
        Some(snapshot)
    }

    /// All registered account ids.
    pub fn ids(&self) -> Vec<AccountId> {
        self.entries.read().keys().copied().collect()
    }

    pub fn contains(&self, id: AccountId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Mark an account as needing a write-behind flush.
    pub fn mark_dirty(&self, id: AccountId) {
        self.dirty.lock().insert(id);
        self.dirty_notify.notify_one();
    }

    /// Drain the dirty set, coalescing repeated mutations of one account into one flush.
    pub fn take_dirty(&self) -> Vec<AccountId> {
        self.dirty.lock().drain().collect()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Await notification that the dirty set grew.
    pub async fn dirty_notified(&self) {
        self.dirty_notify.notified().await
    }
}
