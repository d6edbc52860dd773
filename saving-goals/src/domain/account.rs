//! The Account aggregate.
//!
//! An account is created once, accumulates a balance from recorded
//! transactions, and may carry a [`SavingGoal`].

use super::saving::{SavingGoal, Threshold};
use super::{DomainEvent, EventType};
use crate::aggregate::Aggregate;
use crate::errors::UnsupportedEvent;
use crate::types::{StreamId, Timestamp};
use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account identifier.
///
/// Non-empty, at most 128 characters, and free of `:` so it can be embedded
/// in spending identifiers.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128, predicate = |id: &str| !id.contains(':')),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AccountId(String);

impl AccountId {
    /// Recovers the account id from an account stream id.
    pub fn from_stream(stream_id: &StreamId) -> Option<Self> {
        stream_id
            .as_ref()
            .strip_prefix(Account::TYPE_NAME)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|id| Self::try_new(id).ok())
    }
}

/// Domain rule violations raised by the account aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    /// A saving goal needs at least one threshold.
    #[error("saving goal must have at least one threshold")]
    AtLeastOneThreshold,

    /// A saving goal amount of zero is meaningless.
    #[error("saving goal amount must not be zero")]
    GoalAmountZero,

    /// A saving goal amount below zero is meaningless.
    #[error("saving goal amount must be positive, got {0}")]
    NegativeGoalAmount(Decimal),

    /// The command needs an active saving goal.
    #[error("account has no saving goal set")]
    NoSavingGoalSet,

    /// The threshold is already part of the saving goal.
    #[error("threshold {0} is already set on the saving goal")]
    ThresholdAlreadyExists(Threshold),

    /// The resulting balance does not fit in a decimal.
    #[error("recording {amount} on a balance of {balance} overflows")]
    BalanceOverflow {
        /// Balance before the transaction
        balance: Decimal,
        /// Rejected amount
        amount: Decimal,
    },
}

/// The account was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCreated {
    /// Identifier of the new account
    pub account_id: AccountId,
}

/// The account's saving goal was replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavingGoalChanged {
    /// The new goal
    pub goal: SavingGoal,
}

/// A threshold was added to the current saving goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSet {
    /// The added threshold
    pub threshold: Threshold,
}

/// The saving goal was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavingGoalDisabled;

/// Money moved in (positive) or out (negative) of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTransactionRecorded {
    /// Signed amount
    pub amount: Decimal,
    /// When the transaction happened
    pub recorded_at: Timestamp,
}

/// Events recorded on an account stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    /// See [`AccountCreated`]
    Created(AccountCreated),
    /// See [`SavingGoalChanged`]
    SavingGoalChanged(SavingGoalChanged),
    /// See [`ThresholdSet`]
    ThresholdSet(ThresholdSet),
    /// See [`SavingGoalDisabled`]
    SavingGoalDisabled(SavingGoalDisabled),
    /// See [`AccountTransactionRecorded`]
    TransactionRecorded(AccountTransactionRecorded),
}

impl AccountEvent {
    /// Registered name of the wrapped payload.
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => AccountCreated::EVENT_TYPE,
            Self::SavingGoalChanged(_) => SavingGoalChanged::EVENT_TYPE,
            Self::ThresholdSet(_) => ThresholdSet::EVENT_TYPE,
            Self::SavingGoalDisabled(_) => SavingGoalDisabled::EVENT_TYPE,
            Self::TransactionRecorded(_) => AccountTransactionRecorded::EVENT_TYPE,
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Created(e) => serde_json::to_value(e),
            Self::SavingGoalChanged(e) => serde_json::to_value(e),
            Self::ThresholdSet(e) => serde_json::to_value(e),
            Self::SavingGoalDisabled(e) => serde_json::to_value(e),
            Self::TransactionRecorded(e) => serde_json::to_value(e),
        }
    }
}

macro_rules! account_event {
    ($payload:ident, $variant:ident, $name:literal) => {
        impl EventType for $payload {
            const EVENT_TYPE: &'static str = $name;
        }

        impl From<$payload> for AccountEvent {
            fn from(event: $payload) -> Self {
                Self::$variant(event)
            }
        }

        impl From<$payload> for DomainEvent {
            fn from(event: $payload) -> Self {
                Self::Account(AccountEvent::$variant(event))
            }
        }
    };
}

account_event!(AccountCreated, Created, "account_was_created");
account_event!(SavingGoalChanged, SavingGoalChanged, "saving_goal_was_changed");
account_event!(ThresholdSet, ThresholdSet, "threshold_was_set");
account_event!(SavingGoalDisabled, SavingGoalDisabled, "saving_goal_was_disabled");
account_event!(
    AccountTransactionRecorded,
    TransactionRecorded,
    "account_transaction_was_recorded"
);

/// Account state rebuilt from its stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    id: Option<AccountId>,
    balance: Decimal,
    saving_goal: Option<SavingGoal>,
}

impl Account {
    /// The account id, once created.
    pub const fn id(&self) -> Option<&AccountId> {
        self.id.as_ref()
    }

    /// Sum of all recorded transaction amounts.
    pub const fn balance(&self) -> Decimal {
        self.balance
    }

    /// The active saving goal, if any.
    pub const fn saving_goal(&self) -> Option<&SavingGoal> {
        self.saving_goal.as_ref()
    }

    /// Opens a new account with a zero balance and no goal.
    ///
    /// Uniqueness is enforced when the event is saved to a new stream.
    pub const fn create(account_id: AccountId) -> AccountCreated {
        AccountCreated { account_id }
    }

    /// Replaces the saving goal.
    pub fn change_saving_goal(&self, goal: SavingGoal) -> Result<SavingGoalChanged, AccountError> {
        if goal.thresholds.is_empty() {
            return Err(AccountError::AtLeastOneThreshold);
        }
        if goal.amount.is_zero() {
            return Err(AccountError::GoalAmountZero);
        }
        if goal.amount.is_sign_negative() {
            return Err(AccountError::NegativeGoalAmount(goal.amount));
        }
        Ok(SavingGoalChanged { goal })
    }

    /// Adds a threshold to the current saving goal.
    pub fn set_new_threshold(&self, threshold: Threshold) -> Result<ThresholdSet, AccountError> {
        let goal = self
            .saving_goal
            .as_ref()
            .ok_or(AccountError::NoSavingGoalSet)?;
        if goal.has_threshold(threshold) {
            return Err(AccountError::ThresholdAlreadyExists(threshold));
        }
        Ok(ThresholdSet { threshold })
    }

    /// Records a deposit or withdrawal. Any amount is accepted as long as
    /// the new balance stays representable.
    pub fn record_transaction(
        &self,
        amount: Decimal,
        recorded_at: Timestamp,
    ) -> Result<AccountTransactionRecorded, AccountError> {
        if self.balance.checked_add(amount).is_none() {
            return Err(AccountError::BalanceOverflow {
                balance: self.balance,
                amount,
            });
        }
        Ok(AccountTransactionRecorded {
            amount,
            recorded_at,
        })
    }

    /// Removes the saving goal.
    pub const fn disable_saving_goal(&self) -> Result<SavingGoalDisabled, AccountError> {
        if self.saving_goal.is_none() {
            return Err(AccountError::NoSavingGoalSet);
        }
        Ok(SavingGoalDisabled)
    }
}

impl Aggregate for Account {
    const TYPE_NAME: &'static str = "account";
    type Id = AccountId;

    fn apply(&mut self, event: &DomainEvent) -> Result<(), UnsupportedEvent> {
        let DomainEvent::Account(event) = event else {
            return Err(Self::unsupported(event));
        };
        match event {
            AccountEvent::Created(e) => {
                self.id = Some(e.account_id.clone());
                self.balance = Decimal::ZERO;
                self.saving_goal = None;
            }
            AccountEvent::SavingGoalChanged(e) => self.saving_goal = Some(e.goal.clone()),
            AccountEvent::ThresholdSet(e) => {
                if let Some(goal) = self.saving_goal.as_mut() {
                    goal.thresholds.insert(e.threshold);
                }
            }
            AccountEvent::SavingGoalDisabled(_) => self.saving_goal = None,
            // recorded amounts were checked against the balance
            AccountEvent::TransactionRecorded(e) => {
                self.balance = self.balance.saturating_add(e.amount);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::interval::{CalendarMonth, MonthStarted};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn id(s: &str) -> AccountId {
        AccountId::try_new(s).unwrap()
    }

    fn threshold(v: Decimal) -> Threshold {
        Threshold::try_new(v).unwrap()
    }

    fn goal(amount: Decimal, thresholds: &[Decimal]) -> SavingGoal {
        SavingGoal::new(amount, thresholds.iter().copied().map(threshold))
    }

    fn created() -> Account {
        let event: DomainEvent = Account::create(id("alice")).into();
        Account::replay([&event]).unwrap()
    }

    fn with_goal() -> Account {
        let mut account = created();
        let changed = account
            .change_saving_goal(goal(dec!(500), &[dec!(0.25), dec!(0.5)]))
            .unwrap();
        account.apply(&changed.into()).unwrap();
        account
    }

    #[test]
    fn creation_starts_with_zero_balance_and_no_goal() {
        let account = created();
        assert_eq!(account.id(), Some(&id("alice")));
        assert_eq!(account.balance(), Decimal::ZERO);
        assert!(account.saving_goal().is_none());
    }

    #[test]
    fn change_goal_requires_a_threshold() {
        let account = created();
        assert_eq!(
            account.change_saving_goal(goal(dec!(100), &[])),
            Err(AccountError::AtLeastOneThreshold)
        );
        // empty thresholds win over a zero amount
        assert_eq!(
            account.change_saving_goal(goal(dec!(0), &[])),
            Err(AccountError::AtLeastOneThreshold)
        );
    }

    #[test]
    fn change_goal_rejects_zero_and_negative_amounts() {
        let account = created();
        assert_eq!(
            account.change_saving_goal(goal(dec!(0), &[dec!(0.5)])),
            Err(AccountError::GoalAmountZero)
        );
        assert_eq!(
            account.change_saving_goal(goal(dec!(-10), &[dec!(0.5)])),
            Err(AccountError::NegativeGoalAmount(dec!(-10)))
        );
    }

    #[test]
    fn change_goal_replaces_previous_goal() {
        let mut account = with_goal();
        let replacement = goal(dec!(800), &[dec!(0.9)]);
        let event = account.change_saving_goal(replacement.clone()).unwrap();
        account.apply(&event.into()).unwrap();
        assert_eq!(account.saving_goal(), Some(&replacement));
    }

    #[test]
    fn set_threshold_requires_goal() {
        assert_eq!(
            created().set_new_threshold(threshold(dec!(0.3))),
            Err(AccountError::NoSavingGoalSet)
        );
    }

    #[test]
    fn set_threshold_rejects_duplicates() {
        let account = with_goal();
        assert_eq!(
            account.set_new_threshold(threshold(dec!(0.50))),
            Err(AccountError::ThresholdAlreadyExists(threshold(dec!(0.5))))
        );
    }

    #[test]
    fn set_threshold_extends_goal() {
        let mut account = with_goal();
        let event = account.set_new_threshold(threshold(dec!(0.75))).unwrap();
        account.apply(&event.into()).unwrap();
        let thresholds: Vec<_> = account
            .saving_goal()
            .unwrap()
            .thresholds
            .iter()
            .map(|t| t.into_inner())
            .collect();
        assert_eq!(thresholds, vec![dec!(0.25), dec!(0.5), dec!(0.75)]);
    }

    #[test]
    fn disable_goal() {
        let mut account = with_goal();
        let event = account.disable_saving_goal().unwrap();
        account.apply(&event.into()).unwrap();
        assert!(account.saving_goal().is_none());
        assert_eq!(
            account.disable_saving_goal(),
            Err(AccountError::NoSavingGoalSet)
        );
    }

    #[test]
    fn rejects_events_of_other_streams() {
        let mut account = created();
        let foreign: DomainEvent = MonthStarted {
            month: CalendarMonth::try_new(2024, 1).unwrap(),
        }
        .into();
        let err = account.apply(&foreign).unwrap_err();
        assert_eq!(err.aggregate, "account");
        assert_eq!(err.event_type, "month_started");
    }

    #[test]
    fn account_id_from_stream() {
        let stream = StreamId::try_new("account-alice").unwrap();
        assert_eq!(AccountId::from_stream(&stream), Some(id("alice")));
        let other = StreamId::try_new("monthly-spending-account:alice:month:2024-01").unwrap();
        assert_eq!(AccountId::from_stream(&other), None);
    }

    #[test]
    fn account_id_rejects_colon() {
        assert!(AccountId::try_new("a:b").is_err());
        assert!(AccountId::try_new("  ").is_err());
    }

    #[test]
    fn overflowing_balance_is_rejected() {
        let mut account = created();
        let opening = account
            .record_transaction(Decimal::MAX, Timestamp::now())
            .unwrap();
        account.apply(&opening.into()).unwrap();

        assert_eq!(
            account.record_transaction(dec!(1), Timestamp::now()),
            Err(AccountError::BalanceOverflow {
                balance: Decimal::MAX,
                amount: dec!(1),
            })
        );
        // withdrawals from the maximum are still fine
        assert!(account.record_transaction(dec!(-1), Timestamp::now()).is_ok());
    }

    proptest! {
        #[test]
        fn replayed_balance_is_sum_of_amounts(amounts in prop::collection::vec(-100_000i64..100_000, 0..30)) {
            let mut events: Vec<DomainEvent> = vec![Account::create(id("bob")).into()];
            let mut account = Account::default();
            for cents in &amounts {
                events.push(
                    account
                        .record_transaction(Decimal::new(*cents, 2), Timestamp::now())
                        .unwrap()
                        .into(),
                );
            }
            account = Account::replay(&events).unwrap();
            let expected: Decimal = amounts.iter().map(|c| Decimal::new(*c, 2)).sum();
            prop_assert_eq!(account.balance(), expected);
        }

        #[test]
        fn recording_adds_exactly_the_amount(start in -1_000_000i64..1_000_000, amount in -1_000_000i64..1_000_000) {
            let mut account = created();
            let opening = account
                .record_transaction(Decimal::new(start, 2), Timestamp::now())
                .unwrap();
            account.apply(&opening.into()).unwrap();
            let event = account
                .record_transaction(Decimal::new(amount, 2), Timestamp::now())
                .unwrap();
            prop_assert_eq!(event.amount, Decimal::new(amount, 2));
            account.apply(&event.into()).unwrap();
            prop_assert_eq!(account.balance(), Decimal::new(start, 2) + Decimal::new(amount, 2));
        }
    }
}
