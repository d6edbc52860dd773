//! Commands, their handlers, and the bus that routes them.
//!
//! Every handler follows the same shape: load (or create) the aggregate,
//! let it decide which events to record, then save with an optimistic
//! concurrency check.

use crate::aggregate::{Committed, Repository};
use crate::domain::account::{Account, AccountId};
use crate::domain::interval::CalendarMonth;
use crate::domain::saving::{SavingGoal, Threshold};
use crate::domain::spending::{Spending, SpendingId};
use crate::errors::CommandResult;
use crate::event_store::{EventStore, SerializedEvent};
use crate::registry::EventRegistry;
use crate::types::Timestamp;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};

/// Open a new account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccount {
    /// Id of the account to open
    pub account_id: AccountId,
}

/// Replace the saving goal of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSavingGoal {
    /// Target account
    pub account_id: AccountId,
    /// The new goal
    pub goal: SavingGoal,
}

/// Add a threshold to the current saving goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNewThreshold {
    /// Target account
    pub account_id: AccountId,
    /// Threshold to add
    pub value: Threshold,
}

/// Remove the saving goal of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisableSavingGoal {
    /// Target account
    pub account_id: AccountId,
}

/// Record a deposit (positive) or withdrawal (negative) on an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAccountTransaction {
    /// Target account
    pub account_id: AccountId,
    /// Signed amount
    pub amount: Decimal,
    /// When the transaction happened
    pub recorded_at: Timestamp,
}

/// Begin tracking an account's spending for a month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSpendingTracking {
    /// Tracked account
    pub account_id: AccountId,
    /// Tracked month
    pub month: CalendarMonth,
    /// Account balance at the start of the month
    pub starting_balance: Decimal,
    /// Goal in force at the start of the month
    pub goal: SavingGoal,
}

/// Count an account transaction against a month's spending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSpendingTransaction {
    /// Tracked account
    pub account_id: AccountId,
    /// Month the transaction belongs to
    pub month: CalendarMonth,
    /// Signed amount
    pub amount: Decimal,
}

/// Every command the system accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// See [`CreateAccount`]
    CreateAccount(CreateAccount),
    /// See [`ChangeSavingGoal`]
    ChangeSavingGoal(ChangeSavingGoal),
    /// See [`SetNewThreshold`]
    SetNewThreshold(SetNewThreshold),
    /// See [`DisableSavingGoal`]
    DisableSavingGoal(DisableSavingGoal),
    /// See [`RecordAccountTransaction`]
    RecordAccountTransaction(RecordAccountTransaction),
    /// See [`StartSpendingTracking`]
    StartSpendingTracking(StartSpendingTracking),
    /// See [`RecordSpendingTransaction`]
    RecordSpendingTransaction(RecordSpendingTransaction),
}

impl Command {
    /// Short command name for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateAccount(_) => "create_account",
            Self::ChangeSavingGoal(_) => "change_saving_goal",
            Self::SetNewThreshold(_) => "set_new_threshold",
            Self::DisableSavingGoal(_) => "disable_saving_goal",
            Self::RecordAccountTransaction(_) => "record_account_transaction",
            Self::StartSpendingTracking(_) => "start_spending_tracking",
            Self::RecordSpendingTransaction(_) => "record_spending_transaction",
        }
    }

    /// The account the command concerns.
    pub const fn account_id(&self) -> &AccountId {
        match self {
            Self::CreateAccount(c) => &c.account_id,
            Self::ChangeSavingGoal(c) => &c.account_id,
            Self::SetNewThreshold(c) => &c.account_id,
            Self::DisableSavingGoal(c) => &c.account_id,
            Self::RecordAccountTransaction(c) => &c.account_id,
            Self::StartSpendingTracking(c) => &c.account_id,
            Self::RecordSpendingTransaction(c) => &c.account_id,
        }
    }
}

macro_rules! into_command {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Command {
                fn from(command: $variant) -> Self {
                    Self::$variant(command)
                }
            }
        )*
    };
}

into_command!(
    CreateAccount,
    ChangeSavingGoal,
    SetNewThreshold,
    DisableSavingGoal,
    RecordAccountTransaction,
    StartSpendingTracking,
    RecordSpendingTransaction,
);

/// Sends commands to their handler.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Handles `command`, returning what was appended.
    async fn dispatch(&self, command: Command) -> CommandResult<Committed>;
}

/// Handles commands targeting the Account aggregate.
pub struct AccountCommandHandler<S> {
    repository: Repository<Account, S>,
}

impl<S> AccountCommandHandler<S>
where
    S: EventStore<Event = SerializedEvent>,
{
    /// Creates a handler backed by `repository`.
    pub const fn new(repository: Repository<Account, S>) -> Self {
        Self { repository }
    }

    /// Opens an account. A second creation of the same id conflicts on save.
    #[instrument(skip(self, command), fields(account_id = %command.account_id))]
    pub async fn create_account(&self, command: CreateAccount) -> CommandResult<Committed> {
        let mut root = self.repository.create(&command.account_id)?;
        root.record(Account::create(command.account_id))?;
        self.repository.save(root).await
    }

    /// Replaces the saving goal.
    #[instrument(skip(self, command), fields(account_id = %command.account_id))]
    pub async fn change_saving_goal(&self, command: ChangeSavingGoal) -> CommandResult<Committed> {
        let mut root = self.repository.load(&command.account_id).await?;
        let event = root.state().change_saving_goal(command.goal)?;
        root.record(event)?;
        self.repository.save(root).await
    }

    /// Adds a threshold to the saving goal.
    #[instrument(skip(self, command), fields(account_id = %command.account_id, threshold = %command.value))]
    pub async fn set_new_threshold(&self, command: SetNewThreshold) -> CommandResult<Committed> {
        let mut root = self.repository.load(&command.account_id).await?;
        let event = root.state().set_new_threshold(command.value)?;
        root.record(event)?;
        self.repository.save(root).await
    }

    /// Removes the saving goal.
    #[instrument(skip(self, command), fields(account_id = %command.account_id))]
    pub async fn disable_saving_goal(&self, command: DisableSavingGoal) -> CommandResult<Committed> {
        let mut root = self.repository.load(&command.account_id).await?;
        let event = root.state().disable_saving_goal()?;
        root.record(event)?;
        self.repository.save(root).await
    }

    /// Records a transaction on the account.
    #[instrument(skip(self, command), fields(account_id = %command.account_id, amount = %command.amount))]
    pub async fn record_transaction(
        &self,
        command: RecordAccountTransaction,
    ) -> CommandResult<Committed> {
        let mut root = self.repository.load(&command.account_id).await?;
        let event = root
            .state()
            .record_transaction(command.amount, command.recorded_at)?;
        root.record(event)?;
        self.repository.save(root).await
    }
}

/// Handles commands targeting the Spending aggregate.
pub struct SpendingCommandHandler<S> {
    repository: Repository<Spending, S>,
}

impl<S> SpendingCommandHandler<S>
where
    S: EventStore<Event = SerializedEvent>,
{
    /// Creates a handler backed by `repository`.
    pub const fn new(repository: Repository<Spending, S>) -> Self {
        Self { repository }
    }

    /// Starts tracking a month. A second start for the same month conflicts
    /// on save.
    #[instrument(skip(self, command), fields(account_id = %command.account_id, month = %command.month))]
    pub async fn start_tracking(&self, command: StartSpendingTracking) -> CommandResult<Committed> {
        let id = SpendingId::new(command.account_id.clone(), command.month);
        let mut root = self.repository.create(&id)?;
        root.record(Spending::start(
            command.account_id,
            command.month,
            command.starting_balance,
            &command.goal,
        )?)?;
        self.repository.save(root).await
    }

    /// Counts a transaction against a tracked month.
    #[instrument(skip(self, command), fields(account_id = %command.account_id, month = %command.month, amount = %command.amount))]
    pub async fn record_transaction(
        &self,
        command: RecordSpendingTransaction,
    ) -> CommandResult<Committed> {
        let id = SpendingId::new(command.account_id, command.month);
        let mut root = self.repository.load(&id).await?;
        for event in root.state().record_transaction(command.amount)? {
            root.record(event)?;
        }
        self.repository.save(root).await
    }
}

/// Routes each [`Command`] to exactly one handler.
pub struct CommandBus<S> {
    accounts: AccountCommandHandler<S>,
    spendings: SpendingCommandHandler<S>,
}

impl<S> CommandBus<S>
where
    S: EventStore<Event = SerializedEvent>,
{
    /// Wires both handlers over the same store and registry.
    pub fn new(store: Arc<S>, registry: Arc<EventRegistry>) -> Self {
        Self {
            accounts: AccountCommandHandler::new(Repository::new(
                Arc::clone(&store),
                Arc::clone(&registry),
            )),
            spendings: SpendingCommandHandler::new(Repository::new(store, registry)),
        }
    }
}

#[async_trait]
impl<S> CommandDispatcher for CommandBus<S>
where
    S: EventStore<Event = SerializedEvent> + 'static,
{
    async fn dispatch(&self, command: Command) -> CommandResult<Committed> {
        let name = command.name();
        let committed = match command {
            Command::CreateAccount(c) => self.accounts.create_account(c).await,
            Command::ChangeSavingGoal(c) => self.accounts.change_saving_goal(c).await,
            Command::SetNewThreshold(c) => self.accounts.set_new_threshold(c).await,
            Command::DisableSavingGoal(c) => self.accounts.disable_saving_goal(c).await,
            Command::RecordAccountTransaction(c) => self.accounts.record_transaction(c).await,
            Command::StartSpendingTracking(c) => self.spendings.start_tracking(c).await,
            Command::RecordSpendingTransaction(c) => self.spendings.record_transaction(c).await,
        }?;
        info!(
            command = name,
            stream_id = %committed.stream_id,
            version = %committed.version,
            events = committed.events.len(),
            "command handled"
        );
        Ok(committed)
    }
}
