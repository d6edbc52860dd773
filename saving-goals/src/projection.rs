//! The `AccountsWithSavingGoals` read model.
//!
//! Keeps balance and saving goal per account, fed from account streams, and
//! answers which accounts currently have a goal. It is eventually consistent
//! and never used to decide writes.

use crate::domain::account::{AccountEvent, AccountId};
use crate::domain::saving::SavingGoal;
use crate::domain::DomainEvent;
use crate::errors::{ProjectionError, ProjectionResult};
use crate::event_store::{EventFilter, StoredEvent};
use crate::shutdown::CancellationSignal;
use crate::subscription::EventHandler;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use nutype::nutype;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

/// Subscription name of the projection.
pub const ACCOUNTS_WITH_SAVING_GOALS: &str = "accounts-with-saving-goals";

/// Number of entries the query copies out of the read model per lock
/// acquisition.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Display, Into, Default),
    default = 64
)]
pub struct BufferSize(usize);

/// What the read model knows about one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountEntry {
    /// Sum of recorded transactions
    pub balance: Decimal,
    /// Active goal, if any
    pub saving_goal: Option<SavingGoal>,
}

/// One result of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountWithSavingGoal {
    /// The account
    pub account_id: AccountId,
    /// Its balance as last projected
    pub balance: Decimal,
    /// Its active goal
    pub saving_goal: SavingGoal,
}

/// Parameters of the accounts-with-saving-goals query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountsWithSavingGoalsQuery {
    /// Page size used while producing results
    pub buffer_size: BufferSize,
}

type Entries = Arc<RwLock<HashMap<AccountId, AccountEntry>>>;

/// In-memory read model of accounts and their saving goals.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct AccountsWithSavingGoals {
    entries: Entries,
}

impl AccountsWithSavingGoals {
    /// Creates an empty read model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one account event into the entry of `account_id`.
    ///
    /// An entry is created on first sight of the account. Re-applying a
    /// creation or threshold event leaves the entry unchanged.
    pub async fn apply(&self, account_id: &AccountId, event: &AccountEvent) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(account_id.clone()).or_default();
        match event {
            AccountEvent::Created(_) => {}
            AccountEvent::SavingGoalChanged(e) => entry.saving_goal = Some(e.goal.clone()),
            AccountEvent::ThresholdSet(e) => {
                if let Some(goal) = entry.saving_goal.as_mut() {
                    goal.thresholds.insert(e.threshold);
                }
            }
            AccountEvent::SavingGoalDisabled(_) => entry.saving_goal = None,
            AccountEvent::TransactionRecorded(e) => {
                entry.balance = entry.balance.saturating_add(e.amount);
            }
        }
    }

    /// Current entry of one account.
    pub async fn entry(&self, account_id: &AccountId) -> Option<AccountEntry> {
        self.entries.read().await.get(account_id).cloned()
    }

    /// Number of known accounts, with or without a goal.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no account is known yet.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Streams every account that has a saving goal, ordered by account id.
    ///
    /// The set of accounts is fixed when the query is made; entries are then
    /// read page by page, and an account whose goal was disabled in between
    /// is left out. The stream ends early once `cancel` fires and owns no
    /// background task, so dropping it mid-way is always safe.
    pub async fn query(
        &self,
        query: AccountsWithSavingGoalsQuery,
        cancel: CancellationSignal,
    ) -> BoxStream<'static, AccountWithSavingGoal> {
        let mut ids: Vec<AccountId> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.saving_goal.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_unstable();

        let page_size = query.buffer_size.into_inner();
        let state = QueryState {
            entries: Arc::clone(&self.entries),
            remaining: ids.into(),
            buffer: VecDeque::with_capacity(page_size),
            page_size,
            cancel,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if state.cancel.is_cancelled() {
                    trace!("accounts query cancelled");
                    return None;
                }
                if let Some(item) = state.buffer.pop_front() {
                    return Some((item, state));
                }
                if state.remaining.is_empty() {
                    return None;
                }
                state.fill_page().await?;
            }
        })
        .boxed()
    }
}

struct QueryState {
    entries: Entries,
    remaining: VecDeque<AccountId>,
    buffer: VecDeque<AccountWithSavingGoal>,
    page_size: usize,
    cancel: CancellationSignal,
}

impl QueryState {
    /// Copies the next page into the buffer. `None` when cancelled while
    /// waiting for the lock.
    async fn fill_page(&mut self) -> Option<()> {
        let map = Arc::clone(&self.entries);
        let entries = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return None,
            guard = map.read() => guard,
        };
        let take = self.page_size.min(self.remaining.len());
        for account_id in self.remaining.drain(..take) {
            let Some(entry) = entries.get(&account_id) else {
                continue;
            };
            if let Some(goal) = &entry.saving_goal {
                self.buffer.push_back(AccountWithSavingGoal {
                    account_id,
                    balance: entry.balance,
                    saving_goal: goal.clone(),
                });
            }
        }
        Some(())
    }
}

#[async_trait]
impl EventHandler for AccountsWithSavingGoals {
    type Error = ProjectionError;

    fn name(&self) -> &str {
        ACCOUNTS_WITH_SAVING_GOALS
    }

    fn filter(&self) -> EventFilter {
        EventFilter::prefix("account-")
    }

    async fn handle(&self, event: &StoredEvent<DomainEvent>) -> ProjectionResult<()> {
        let unexpected = || ProjectionError::UnexpectedEvent {
            stream: event.stream_id.clone(),
            event_type: event.payload.event_type(),
        };
        let DomainEvent::Account(account_event) = &event.payload else {
            return Err(unexpected());
        };
        let account_id = AccountId::from_stream(&event.stream_id).ok_or_else(unexpected)?;
        self.apply(&account_id, account_event).await;
        Ok(())
    }
}
