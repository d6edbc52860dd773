//! Demonstration workload.
//!
//! Opens two accounts with goals, starts the current month, then moves money
//! on the account that qualified until one of its thresholds is reported.

use crate::service::{eventually, SavingGoalsService, ServiceError};
use chrono::{TimeDelta, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use saving_goals::commands::{ChangeSavingGoal, CreateAccount, RecordAccountTransaction};
use saving_goals::domain::account::{AccountId, AccountIdError};
use saving_goals::domain::interval::CalendarMonth;
use saving_goals::domain::saving::{SavingGoal, Threshold, ThresholdError};
use saving_goals::errors::CommandError;
use saving_goals::event_store::{EventStore, SerializedEvent};
use saving_goals::types::Timestamp;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the demonstration stopped early.
#[derive(Debug, Error)]
pub enum DemoError {
    /// A command was rejected.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The service failed outside command handling.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A hard-coded identifier was rejected.
    #[error(transparent)]
    AccountId(#[from] AccountIdError),

    /// A hard-coded threshold was rejected.
    #[error(transparent)]
    Threshold(#[from] ThresholdError),

    /// An asynchronous effect did not show up in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

fn goal(amount: Decimal, thresholds: &[Decimal]) -> Result<SavingGoal, DemoError> {
    let thresholds = thresholds
        .iter()
        .map(|t| Threshold::try_new(*t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SavingGoal::new(amount, thresholds))
}

/// Runs the demonstration against `service`.
pub async fn run<S>(service: &SavingGoalsService<S>) -> Result<(), DemoError>
where
    S: EventStore<Event = SerializedEvent> + 'static,
{
    let alice = AccountId::try_new("alice")?;
    let bob = AccountId::try_new("bob")?;
    let now = Utc::now();
    let month = CalendarMonth::of(&now);
    // opening balances belong to an earlier month so they never count as spending
    let opened_at = Timestamp::new(now - TimeDelta::days(40));

    for (account_id, deposit, target) in [
        (&alice, dec!(1500), goal(dec!(1000), &[dec!(0.5), dec!(0.9)])?),
        (&bob, dec!(200), goal(dec!(500), &[dec!(0.5)])?),
    ] {
        service
            .dispatch(CreateAccount {
                account_id: account_id.clone(),
            })
            .await?;
        service
            .dispatch(RecordAccountTransaction {
                account_id: account_id.clone(),
                amount: deposit,
                recorded_at: opened_at,
            })
            .await?;
        service
            .dispatch(ChangeSavingGoal {
                account_id: account_id.clone(),
                goal: target,
            })
            .await?;
    }

    eventually(SETTLE_TIMEOUT, || async move {
        (service.accounts_with_saving_goals().await.len() == 2).then_some(())
    })
    .await
    .ok_or(DemoError::Timeout("the projection to list both goals"))?;

    service.start_month(month).await?;

    let spending = eventually(SETTLE_TIMEOUT, || {
        let alice = alice.clone();
        async move { service.spending(alice, month).await.ok() }
    })
    .await
    .ok_or(DemoError::Timeout("spending tracking to start"))?;
    info!(
        account_id = %alice,
        %month,
        desired_balance = %spending.desired_balance(),
        "spending tracking started"
    );

    // bob's balance is below his goal, so only alice is tracked
    for amount in [dec!(2000), dec!(-400), dec!(-50)] {
        service
            .dispatch(RecordAccountTransaction {
                account_id: alice.clone(),
                amount,
                recorded_at: Timestamp::now(),
            })
            .await?;
    }

    let expected_balance = dec!(3050);
    let spending = eventually(SETTLE_TIMEOUT, || {
        let alice = alice.clone();
        async move {
            service
                .spending(alice, month)
                .await
                .ok()
                .filter(|s| s.current_balance() == expected_balance)
        }
    })
    .await
    .ok_or(DemoError::Timeout("transactions to reach the spending"))?;

    info!(
        account_id = %alice,
        %month,
        balance = %spending.current_balance(),
        spending_limit = %spending.spending_limit(),
        last_threshold = ?spending.last_triggered_threshold().map(Threshold::into_inner),
        "demonstration finished"
    );
    Ok(())
}
