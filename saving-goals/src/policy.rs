//! Process managers linking the account and spending aggregates.
//!
//! The decisions live in stateless policies ([`StartOfMonthPolicy`],
//! [`RecordTransactionPolicy`]); the process managers are the subscription
//! handlers that feed them events and dispatch the resulting commands.

use crate::commands::{
    Command, CommandDispatcher, RecordSpendingTransaction, StartSpendingTracking,
};
use crate::domain::account::{AccountEvent, AccountId, AccountTransactionRecorded};
use crate::domain::interval::CalendarMonth;
use crate::domain::DomainEvent;
use crate::errors::CommandError;
use crate::event_store::{EventFilter, StoredEvent};
use crate::projection::{
    AccountWithSavingGoal, AccountsWithSavingGoals, AccountsWithSavingGoalsQuery, BufferSize,
};
use crate::shutdown::CancellationSignal;
use crate::subscription::{EventHandler, FailureContext, FailureStrategy};
use crate::types::StreamId;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Subscription name of the start-of-month process manager.
pub const START_OF_MONTH: &str = "create-spending-start-of-the-month";

/// Subscription name of the record-transaction process manager.
pub const RECORD_TRANSACTION: &str = "record-spending-transaction";

/// Stream holding [`MonthStarted`](crate::domain::interval::MonthStarted) events.
pub const CALENDAR_STREAM: &str = "calendar-month";

/// Failures of a process manager.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A follow-up command was rejected.
    #[error("Failed to dispatch {command}: {source}")]
    Dispatch {
        /// Name of the rejected command
        command: &'static str,
        /// Why it was rejected
        source: CommandError,
    },

    /// An account event arrived on a stream that does not name an account.
    #[error("Stream '{0}' is not an account stream")]
    NotAnAccountStream(StreamId),
}

impl PolicyError {
    fn command_error(&self) -> Option<&CommandError> {
        match self {
            Self::Dispatch { source, .. } => Some(source),
            Self::NotAnAccountStream(_) => None,
        }
    }
}

/// Decides which accounts start spending tracking when a month begins.
pub struct StartOfMonthPolicy;

impl StartOfMonthPolicy {
    /// Start tracking for `account` unless its balance is below the goal.
    pub fn decide(month: CalendarMonth, account: AccountWithSavingGoal) -> Option<StartSpendingTracking> {
        if account.balance < account.saving_goal.amount {
            return None;
        }
        Some(StartSpendingTracking {
            account_id: account.account_id,
            month,
            starting_balance: account.balance,
            goal: account.saving_goal,
        })
    }

    /// One command per account whose balance covers its goal.
    pub fn react<I>(month: CalendarMonth, accounts: I) -> Vec<StartSpendingTracking>
    where
        I: IntoIterator<Item = AccountWithSavingGoal>,
    {
        accounts
            .into_iter()
            .filter_map(|account| Self::decide(month, account))
            .collect()
    }
}

/// Mirrors account transactions into the spending of their month.
pub struct RecordTransactionPolicy;

impl RecordTransactionPolicy {
    /// The spending command for a transaction recorded on `account_id`.
    pub fn react(
        account_id: AccountId,
        event: &AccountTransactionRecorded,
    ) -> RecordSpendingTransaction {
        RecordSpendingTransaction {
            account_id,
            month: CalendarMonth::of(event.recorded_at.as_datetime()),
            amount: event.amount,
        }
    }
}

/// Starts spending tracking for every eligible account when a month starts.
pub struct StartOfMonthProcessManager<D: ?Sized> {
    projection: AccountsWithSavingGoals,
    dispatcher: Arc<D>,
    buffer_size: BufferSize,
    cancel: CancellationSignal,
}

impl<D: CommandDispatcher + ?Sized> StartOfMonthProcessManager<D> {
    /// Creates the process manager reading eligible accounts from `projection`.
    pub fn new(projection: AccountsWithSavingGoals, dispatcher: Arc<D>) -> Self {
        Self {
            projection,
            dispatcher,
            buffer_size: BufferSize::default(),
            cancel: CancellationSignal::never(),
        }
    }

    /// Sets the page size of the projection query.
    #[must_use]
    pub const fn with_buffer_size(mut self, buffer_size: BufferSize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Stops an in-progress account scan when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl<D: CommandDispatcher + ?Sized> EventHandler for StartOfMonthProcessManager<D> {
    type Error = PolicyError;

    fn name(&self) -> &str {
        START_OF_MONTH
    }

    fn filter(&self) -> EventFilter {
        EventFilter::prefix(CALENDAR_STREAM)
    }

    async fn handle(&self, event: &StoredEvent<DomainEvent>) -> Result<(), PolicyError> {
        let DomainEvent::MonthStarted(started) = &event.payload else {
            return Ok(());
        };
        let month = started.month;

        let query = AccountsWithSavingGoalsQuery {
            buffer_size: self.buffer_size,
        };
        let mut accounts = self.projection.query(query, self.cancel.clone()).await;
        let (mut started_count, mut skipped, mut rejected) = (0_usize, 0_usize, 0_usize);

        while let Some(account) = accounts.next().await {
            let Some(command) = StartOfMonthPolicy::decide(month, account) else {
                skipped += 1;
                continue;
            };
            let account_id = command.account_id.clone();
            match self.dispatcher.dispatch(command.into()).await {
                Ok(_) => started_count += 1,
                Err(CommandError::ConcurrencyConflict { .. }) => {
                    debug!(%account_id, %month, "spending tracking already started");
                }
                Err(CommandError::Spending(error)) => {
                    rejected += 1;
                    warn!(%account_id, %month, %error, "spending tracking rejected");
                }
                Err(source) => {
                    return Err(PolicyError::Dispatch {
                        command: "start_spending_tracking",
                        source,
                    });
                }
            }
        }

        info!(%month, started = started_count, below_goal = skipped, rejected, "month started");
        Ok(())
    }

    fn on_error(&self, ctx: FailureContext<'_, PolicyError>) -> FailureStrategy {
        match ctx.error.command_error() {
            Some(CommandError::EventStore(e)) if e.is_transient() => FailureStrategy::Retry,
            _ => FailureStrategy::Fatal,
        }
    }
}

/// Records every account transaction on the spending of its month.
pub struct RecordTransactionProcessManager<D: ?Sized> {
    dispatcher: Arc<D>,
}

impl<D: CommandDispatcher + ?Sized> RecordTransactionProcessManager<D> {
    /// Creates the process manager.
    pub const fn new(dispatcher: Arc<D>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl<D: CommandDispatcher + ?Sized> EventHandler for RecordTransactionProcessManager<D> {
    type Error = PolicyError;

    fn name(&self) -> &str {
        RECORD_TRANSACTION
    }

    fn filter(&self) -> EventFilter {
        EventFilter::prefix("account-")
    }

    async fn handle(&self, event: &StoredEvent<DomainEvent>) -> Result<(), PolicyError> {
        let DomainEvent::Account(AccountEvent::TransactionRecorded(recorded)) = &event.payload
        else {
            return Ok(());
        };
        let account_id = AccountId::from_stream(&event.stream_id)
            .ok_or_else(|| PolicyError::NotAnAccountStream(event.stream_id.clone()))?;

        let command = RecordTransactionPolicy::react(account_id, recorded);
        self.dispatcher
            .dispatch(Command::RecordSpendingTransaction(command))
            .await
            .map(|_| ())
            .map_err(|source| PolicyError::Dispatch {
                command: "record_spending_transaction",
                source,
            })
    }

    /// Transactions of accounts without tracking for that month, or that
    /// the spending rejects, are skipped (and logged by the runner);
    /// conflicting writers and transient store failures are retried.
    fn on_error(&self, ctx: FailureContext<'_, PolicyError>) -> FailureStrategy {
        match ctx.error.command_error() {
            Some(CommandError::AggregateNotFound { .. } | CommandError::Spending(_)) => {
                FailureStrategy::Skip
            }
            Some(CommandError::ConcurrencyConflict { .. }) => FailureStrategy::Retry,
            Some(CommandError::EventStore(e)) if e.is_transient() => FailureStrategy::Retry,
            _ => FailureStrategy::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Committed;
    use crate::domain::account::AccountCreated;
    use crate::domain::saving::{SavingGoal, Threshold};
    use crate::domain::spending::SpendingError;
    use crate::errors::{CommandResult, EventStoreError};
    use crate::types::{EventId, EventVersion, GlobalPosition, Timestamp};
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn id(s: &str) -> AccountId {
        AccountId::try_new(s).unwrap()
    }

    fn month() -> CalendarMonth {
        CalendarMonth::try_new(2024, 6).unwrap()
    }

    fn account(name: &str, balance: Decimal, goal: Decimal) -> AccountWithSavingGoal {
        AccountWithSavingGoal {
            account_id: id(name),
            balance,
            saving_goal: SavingGoal::new(goal, [Threshold::try_new(dec!(0.5)).unwrap()]),
        }
    }

    #[test]
    fn start_of_month_skips_accounts_below_goal() {
        let commands = StartOfMonthPolicy::react(
            month(),
            vec![
                account("under", dec!(99.99), dec!(100)),
                account("exact", dec!(100), dec!(100)),
                account("over", dec!(250), dec!(100)),
            ],
        );
        let ids: Vec<_> = commands.iter().map(|c| c.account_id.as_ref()).collect();
        assert_eq!(ids, vec!["exact", "over"]);
        assert_eq!(commands[1].starting_balance, dec!(250));
        assert_eq!(commands[1].month, month());
    }

    #[test]
    fn start_of_month_with_no_accounts_dispatches_nothing() {
        assert!(StartOfMonthPolicy::react(month(), Vec::new()).is_empty());
    }

    #[test]
    fn record_transaction_uses_month_of_recording() {
        let recorded = AccountTransactionRecorded {
            amount: dec!(-20),
            recorded_at: Timestamp::new(Utc.with_ymd_and_hms(2024, 2, 29, 23, 0, 0).unwrap()),
        };
        let command = RecordTransactionPolicy::react(id("alice"), &recorded);
        assert_eq!(command.month, CalendarMonth::try_new(2024, 2).unwrap());
        assert_eq!(command.amount, dec!(-20));
        assert_eq!(command.account_id, id("alice"));
    }

    /// Dispatcher recording commands and answering with a fixed outcome.
    struct Recording {
        commands: Mutex<Vec<Command>>,
        fail_with: fn(&Command) -> Option<CommandError>,
    }

    impl Recording {
        fn new(fail_with: fn(&Command) -> Option<CommandError>) -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                fail_with,
            })
        }
    }

    #[async_trait]
    impl CommandDispatcher for Recording {
        async fn dispatch(&self, command: Command) -> CommandResult<Committed> {
            let failure = (self.fail_with)(&command);
            self.commands.lock().push(command);
            match failure {
                Some(error) => Err(error),
                None => Ok(Committed {
                    stream_id: StreamId::try_new("s").unwrap(),
                    version: EventVersion::new(1),
                    events: Vec::new(),
                }),
            }
        }
    }

    fn stored(stream: &str, payload: DomainEvent) -> StoredEvent<DomainEvent> {
        StoredEvent {
            event_id: EventId::generate(),
            stream_id: StreamId::try_new(stream).unwrap(),
            event_version: EventVersion::new(1),
            position: GlobalPosition::first(),
            timestamp: Timestamp::now(),
            payload,
        }
    }

    fn transaction(amount: Decimal) -> DomainEvent {
        AccountTransactionRecorded {
            amount,
            recorded_at: Timestamp::new(Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()),
        }
        .into()
    }

    #[tokio::test]
    async fn record_transaction_manager_dispatches_for_transactions_only() {
        let dispatcher = Recording::new(|_| None);
        let manager = RecordTransactionProcessManager::new(Arc::clone(&dispatcher));

        manager
            .handle(&stored("account-alice", AccountCreated { account_id: id("alice") }.into()))
            .await
            .unwrap();
        manager
            .handle(&stored("account-alice", transaction(dec!(-15))))
            .await
            .unwrap();

        let commands = dispatcher.commands.lock();
        assert_eq!(
            *commands,
            vec![Command::RecordSpendingTransaction(RecordSpendingTransaction {
                account_id: id("alice"),
                month: month(),
                amount: dec!(-15),
            })]
        );
    }

    #[tokio::test]
    async fn missing_spending_is_reported_and_skipped() {
        let dispatcher = Recording::new(|_| {
            Some(CommandError::AggregateNotFound {
                stream: StreamId::try_new("monthly-spending-account:bob:month:2024-06").unwrap(),
            })
        });
        let manager = RecordTransactionProcessManager::new(dispatcher);
        let error = manager
            .handle(&stored("account-bob", transaction(dec!(-1))))
            .await
            .unwrap_err();
        let strategy = manager.on_error(FailureContext {
            error: &error,
            position: GlobalPosition::first(),
            retry_count: 0,
        });
        assert_eq!(strategy, FailureStrategy::Skip);
    }

    #[test]
    fn record_transaction_failure_strategies() {
        let manager = RecordTransactionProcessManager::new(Recording::new(|_| None));
        let strategy_for = |source: CommandError| {
            manager.on_error(FailureContext {
                error: &PolicyError::Dispatch {
                    command: "record_spending_transaction",
                    source,
                },
                position: GlobalPosition::first(),
                retry_count: 0,
            })
        };
        let stream = || StreamId::try_new("x").unwrap();
        assert_eq!(
            strategy_for(CommandError::ConcurrencyConflict { stream: stream() }),
            FailureStrategy::Retry
        );
        assert_eq!(
            strategy_for(CommandError::EventStore(EventStoreError::Unavailable("busy".into()))),
            FailureStrategy::Retry
        );
        assert_eq!(
            strategy_for(CommandError::Spending(SpendingError::AmountOverflow)),
            FailureStrategy::Skip
        );
        assert_eq!(
            strategy_for(CommandError::EventStore(EventStoreError::Internal("bug".into()))),
            FailureStrategy::Fatal
        );
    }

    #[tokio::test]
    async fn non_account_stream_is_an_error() {
        let manager = RecordTransactionProcessManager::new(Recording::new(|_| None));
        let result = manager
            .handle(&stored("calendar-month", transaction(dec!(1))))
            .await;
        assert!(matches!(result, Err(PolicyError::NotAnAccountStream(_))));
    }

    async fn projection_with(accounts: &[(&str, Decimal, Option<Decimal>)]) -> AccountsWithSavingGoals {
        let projection = AccountsWithSavingGoals::new();
        for (name, balance, goal) in accounts {
            let account_id = id(name);
            projection
                .apply(
                    &account_id,
                    &AccountTransactionRecorded {
                        amount: *balance,
                        recorded_at: Timestamp::now(),
                    }
                    .into(),
                )
                .await;
            if let Some(goal) = goal {
                let goal = SavingGoal::new(*goal, [Threshold::try_new(dec!(0.5)).unwrap()]);
                projection
                    .apply(
                        &account_id,
                        &crate::domain::account::SavingGoalChanged { goal }.into(),
                    )
                    .await;
            }
        }
        projection
    }

    fn month_started() -> StoredEvent<DomainEvent> {
        stored(
            CALENDAR_STREAM,
            crate::domain::interval::MonthStarted { month: month() }.into(),
        )
    }

    #[tokio::test]
    async fn start_of_month_manager_starts_eligible_accounts() {
        let projection = projection_with(&[
            ("rich", dec!(1000), Some(dec!(500))),
            ("poor", dec!(100), Some(dec!(500))),
            ("nogoal", dec!(1000), None),
        ])
        .await;
        let dispatcher = Recording::new(|_| None);
        let manager = StartOfMonthProcessManager::new(projection, Arc::clone(&dispatcher));

        manager.handle(&month_started()).await.unwrap();

        let commands = dispatcher.commands.lock();
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            &commands[0],
            Command::StartSpendingTracking(c) if c.account_id.as_ref() == "rich" && c.month == month()
        ));
    }

    #[tokio::test]
    async fn start_of_month_tolerates_already_started() {
        let projection = projection_with(&[
            ("a", dec!(1000), Some(dec!(1))),
            ("b", dec!(1000), Some(dec!(1))),
        ])
        .await;
        let dispatcher = Recording::new(|command| {
            (command.account_id().as_ref() == "a").then(|| CommandError::ConcurrencyConflict {
                stream: StreamId::try_new("monthly-spending-account:a:month:2024-06").unwrap(),
            })
        });
        let manager = StartOfMonthProcessManager::new(projection, Arc::clone(&dispatcher));
        manager.handle(&month_started()).await.unwrap();
        assert_eq!(dispatcher.commands.lock().len(), 2);
    }

    #[tokio::test]
    async fn start_of_month_continues_past_rejected_accounts() {
        let projection = projection_with(&[
            ("huge", Decimal::MAX, Some(dec!(1))),
            ("fine", dec!(1000), Some(dec!(1))),
        ])
        .await;
        let dispatcher = Recording::new(|command| {
            (command.account_id().as_ref() == "huge")
                .then_some(CommandError::Spending(SpendingError::AmountOverflow))
        });
        let manager = StartOfMonthProcessManager::new(projection, Arc::clone(&dispatcher));

        manager.handle(&month_started()).await.unwrap();

        let commands = dispatcher.commands.lock();
        assert_eq!(commands.len(), 2);
        assert!(commands
            .iter()
            .any(|c| c.account_id().as_ref() == "fine"));
    }

    #[tokio::test]
    async fn start_of_month_surfaces_other_failures() {
        let projection = projection_with(&[("a", dec!(1000), Some(dec!(1)))]).await;
        let manager = StartOfMonthProcessManager::new(
            projection,
            Recording::new(|_| Some(CommandError::EventStore(EventStoreError::Unavailable("down".into())))),
        );
        let error = manager.handle(&month_started()).await.unwrap_err();
        let strategy = manager.on_error(FailureContext {
            error: &error,
            position: GlobalPosition::first(),
            retry_count: 0,
        });
        assert_eq!(strategy, FailureStrategy::Retry);
    }
}
