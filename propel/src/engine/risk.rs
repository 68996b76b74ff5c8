use crate::engine::{
    Engine,
    account::{Account, AccountStatus, BreachKind, PlanKind},
    worker::retry::RetryJob,
};
use propel_execution::trade::CloseReason;
use tracing::{info, warn};

/// Outcome of a risk/evaluation check on an account.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RiskVerdict {
    /// A risk rule tripped; the account must be breached and flattened.
    Breach(BreachKind),
    /// The evaluation completed.
    Pass,
    /// Step 1 of a two-step evaluation completed.
    Step1Pass,
    /// Nothing to do.
    Hold,
}

/// Evaluate an account against its risk rules and evaluation-progression criteria.
///
/// Order matters: breaches take precedence over progression.
pub fn evaluate(account: &Account) -> RiskVerdict {
    if !account.status.can_trade() {
        return RiskVerdict::Hold;
    }

    if account.daily_pnl <= -account.daily_loss_limit {
        return RiskVerdict::Breach(BreachKind::DailyLoss);
    }

    if account.peak_balance - account.current_balance >= account.max_drawdown_limit {
        return RiskVerdict::Breach(BreachKind::MaxDrawdown);
    }

    if account.current_profit() >= account.profit_target
        && account.trading_days >= account.plan.min_trading_days
    {
        return match (account.plan.kind, account.status) {
            (PlanKind::OneStep, AccountStatus::Active) => RiskVerdict::Pass,
            (PlanKind::TwoStep, AccountStatus::Active) => RiskVerdict::Step1Pass,
            (PlanKind::TwoStep, AccountStatus::Step1Passed) => RiskVerdict::Pass,
            _ => RiskVerdict::Hold,
        };
    }

    RiskVerdict::Hold
}

impl Engine {
    /// Apply the risk verdict for an account while holding its lock.
    ///
    /// A breach flattens every remaining open position with reason BREACH at its current
    /// mark; individual close failures are logged and left for the next evaluation pass
    /// rather than aborting the cascade.
    pub(crate) async fn enforce_risk_locked(&self, account: &mut Account) {
        match evaluate(account) {
            RiskVerdict::Breach(kind) => {
                account.transition_status(AccountStatus::Breached, Some(kind));

                for position in self.positions.get_by_account(account.id) {
                    let exit_price = position.current_price;
                    if let Err(close_error) = self
                        .settle_close_locked(
                            account,
                            &position,
                            position.quantity,
                            exit_price,
                            exit_price,
                            CloseReason::Breach,
                        )
                        .await
                    {
                        warn!(
                            account = %account.id,
                            position = %position.id,
                            ?close_error,
                            "breach close failed - position left for retry"
                        );
                    }
                }

                self.accounts.mark_dirty(account.id);
                self.enqueue_retry(RetryJob::UpdateAccount(Box::new(account.clone())));
                self.emit_account_update(account);
                info!(account = %account.id, ?kind, "account breached");
            }
            RiskVerdict::Pass => {
                account.transition_status(AccountStatus::Passed, None);
                self.accounts.mark_dirty(account.id);
                self.enqueue_retry(RetryJob::UpdateAccount(Box::new(account.clone())));
                self.emit_account_update(account);
                info!(account = %account.id, "evaluation passed");
            }
            RiskVerdict::Step1Pass => {
                account.transition_status(AccountStatus::Step1Passed, None);
                advance_to_step2(account);
                self.accounts.mark_dirty(account.id);
                self.enqueue_retry(RetryJob::UpdateAccount(Box::new(account.clone())));
                self.emit_account_update(account);
                info!(account = %account.id, "evaluation step 1 passed");
            }
            RiskVerdict::Hold => {}
        }
    }
}

impl Engine {
    /// Breach an account by admin action: recorded with an `ADMIN_BREACH` audit event and
    /// applied exactly like a risk breach (flatten, transition, persist).
    pub async fn admin_breach(
        &self,
        account_id: propel_execution::AccountId,
        reason: &str,
    ) -> bool {
        let Some(mut account) = self.accounts.lock(account_id).await else {
            return false;
        };

        self.record_event(propel_execution::event::TradeEvent::new(
            account_id,
            propel_execution::event::TradeEventKind::AdminBreach,
            None,
            None,
            serde_json::json!({ "reason": reason }),
            chrono::Utc::now(),
        ));

        account.transition_status(AccountStatus::Breached, Some(BreachKind::Admin));
        for position in self.positions.get_by_account(account_id) {
            let exit_price = position.current_price;
            if let Err(close_error) = self
                .settle_close_locked(
                    &mut account,
                    &position,
                    position.quantity,
                    exit_price,
                    exit_price,
                    CloseReason::Breach,
                )
                .await
            {
                warn!(
                    account = %account_id,
                    position = %position.id,
                    ?close_error,
                    "admin breach close failed"
                );
            }
        }

        self.accounts.mark_dirty(account_id);
        self.enqueue_retry(RetryJob::UpdateAccount(Box::new(account.clone())));
        self.emit_account_update(&account);
        true
    }
}

/// Reset counters for step 2 of a two-step evaluation: the step trades against the current
/// balance as its new baseline.
fn advance_to_step2(account: &mut Account) {
    account.evaluation_step = 2;
    account.starting_balance = account.current_balance;
    account.peak_balance = account.current_balance;
    account.trading_days = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::account::test_utils::account;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn test_daily_loss_breach() {
        // Limit 500: -450 holds, a further -100 breaches
        let mut checked = account(dec!(10000));
        checked.daily_loss_limit = dec!(500);
        checked.daily_pnl = dec!(-450);
        assert_eq!(evaluate(&checked), RiskVerdict::Hold);

        checked.daily_pnl = dec!(-550);
        assert_eq!(evaluate(&checked), RiskVerdict::Breach(BreachKind::DailyLoss));
    }

    #[test]
    fn test_trailing_drawdown_breach() {
        let mut checked = account(dec!(10000));
        checked.max_drawdown_limit = dec!(1000);
        checked.peak_balance = dec!(11000);
        checked.current_balance = dec!(10001);
        assert_eq!(evaluate(&checked), RiskVerdict::Hold);

        checked.current_balance = dec!(10000);
        assert_eq!(
            evaluate(&checked),
            RiskVerdict::Breach(BreachKind::MaxDrawdown)
        );
    }

    #[test]
    fn test_evaluation_progression() {
        struct TestCase {
            plan_kind: PlanKind,
            status: AccountStatus,
            balance: Decimal,
            trading_days: u32,
            expected: RiskVerdict,
        }

        let cases = vec![
            // TC0: one-step target met with enough trading days
            TestCase {
                plan_kind: PlanKind::OneStep,
                status: AccountStatus::Active,
                balance: dec!(11000),
                trading_days: 5,
                expected: RiskVerdict::Pass,
            },
            // TC1: target met but too few trading days
            TestCase {
                plan_kind: PlanKind::OneStep,
                status: AccountStatus::Active,
                balance: dec!(11000),
                trading_days: 2,
                expected: RiskVerdict::Hold,
            },
            // TC2: two-step, step 1 completes
            TestCase {
                plan_kind: PlanKind::TwoStep,
                status: AccountStatus::Active,
                balance: dec!(11000),
                trading_days: 5,
                expected: RiskVerdict::Step1Pass,
            },
            // TC3: two-step, step 2 completes
            TestCase {
                plan_kind: PlanKind::TwoStep,
                status: AccountStatus::Step1Passed,
                balance: dec!(11000),
                trading_days: 5,
                expected: RiskVerdict::Pass,
            },
            // TC4: target not met
            TestCase {
                plan_kind: PlanKind::OneStep,
                status: AccountStatus::Active,
                balance: dec!(10500),
                trading_days: 5,
                expected: RiskVerdict::Hold,
            },
            // TC5: breached accounts are never re-evaluated
            TestCase {
                plan_kind: PlanKind::OneStep,
                status: AccountStatus::Breached,
                balance: dec!(11000),
                trading_days: 5,
                expected: RiskVerdict::Hold,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let mut checked = account(dec!(10000));
            checked.plan.kind = test.plan_kind;
            checked.status = test.status;
            checked.current_balance = test.balance;
            checked.peak_balance = test.balance.max(checked.peak_balance);
            checked.trading_days = test.trading_days;
            checked.profit_target = dec!(1000);

            assert_eq!(evaluate(&checked), test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_advance_to_step2_resets_baseline() {
        let mut checked = account(dec!(10000));
        checked.current_balance = dec!(11000);
        checked.peak_balance = dec!(11200);
        checked.trading_days = 7;

        advance_to_step2(&mut checked);
        assert_eq!(checked.evaluation_step, 2);
        assert_eq!(checked.starting_balance, dec!(11000));
        assert_eq!(checked.peak_balance, dec!(11000));
        assert_eq!(checked.trading_days, 0);
    }
}
