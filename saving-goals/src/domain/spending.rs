//! The monthly Spending aggregate.
//!
//! One instance per account and calendar month. Deposits establish the
//! spending limit (how far the balance sits above the month's desired
//! balance); withdrawals eat into it, and each time the consumed share
//! reaches a new, higher threshold a single warning event is raised.

use super::account::AccountId;
use super::interval::CalendarMonth;
use super::saving::{SavingGoal, Threshold, Thresholds};
use super::{DomainEvent, EventType};
use crate::aggregate::Aggregate;
use crate::errors::UnsupportedEvent;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifies the spending tracked for one account in one month.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpendingId {
    /// The tracked account
    pub account_id: AccountId,
    /// The tracked month
    pub month: CalendarMonth,
}

impl SpendingId {
    /// Creates the id for `account_id` in `month`.
    pub const fn new(account_id: AccountId, month: CalendarMonth) -> Self {
        Self { account_id, month }
    }
}

impl fmt::Display for SpendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account:{}:month:{}", self.account_id, self.month)
    }
}

/// Domain rule violations raised by the spending aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpendingError {
    /// The stream holds no start event.
    #[error("monthly spending tracking has not been started")]
    NotStarted,

    /// A balance or limit does not fit in a decimal.
    #[error("monthly spending amounts overflow")]
    AmountOverflow,
}

/// Tracking began for an account and month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingTrackingStarted {
    /// Account and month being tracked
    pub id: SpendingId,
    /// Account balance when the month started
    pub starting_balance: Decimal,
    /// Balance the account should end the month with
    pub desired_balance: Decimal,
    /// Thresholds copied from the saving goal
    pub thresholds: Thresholds,
}

/// A transaction counted against the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingTransactionRecorded {
    /// Signed amount
    pub amount: Decimal,
}

/// A deposit moved the spending limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingLimitUpdated {
    /// Balance above the desired balance after the deposit
    pub spending_limit: Decimal,
}

/// Spending crossed a warning threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdReached {
    /// The highest threshold crossed
    pub threshold: Threshold,
}

/// Events recorded on a monthly spending stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendingEvent {
    /// See [`SpendingTrackingStarted`]
    TrackingStarted(SpendingTrackingStarted),
    /// See [`SpendingTransactionRecorded`]
    TransactionRecorded(SpendingTransactionRecorded),
    /// See [`SpendingLimitUpdated`]
    LimitUpdated(SpendingLimitUpdated),
    /// See [`ThresholdReached`]
    ThresholdReached(ThresholdReached),
}

impl SpendingEvent {
    /// Registered name of the wrapped payload.
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::TrackingStarted(_) => SpendingTrackingStarted::EVENT_TYPE,
            Self::TransactionRecorded(_) => SpendingTransactionRecorded::EVENT_TYPE,
            Self::LimitUpdated(_) => SpendingLimitUpdated::EVENT_TYPE,
            Self::ThresholdReached(_) => ThresholdReached::EVENT_TYPE,
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::TrackingStarted(e) => serde_json::to_value(e),
            Self::TransactionRecorded(e) => serde_json::to_value(e),
            Self::LimitUpdated(e) => serde_json::to_value(e),
            Self::ThresholdReached(e) => serde_json::to_value(e),
        }
    }
}

macro_rules! spending_event {
    ($payload:ident, $variant:ident, $name:literal) => {
        impl EventType for $payload {
            const EVENT_TYPE: &'static str = $name;
        }

        impl From<$payload> for SpendingEvent {
            fn from(event: $payload) -> Self {
                Self::$variant(event)
            }
        }

        impl From<$payload> for DomainEvent {
            fn from(event: $payload) -> Self {
                Self::Spending(SpendingEvent::$variant(event))
            }
        }
    };
}

spending_event!(
    SpendingTrackingStarted,
    TrackingStarted,
    "monthly_spending_tracking_started"
);
spending_event!(
    SpendingTransactionRecorded,
    TransactionRecorded,
    "monthly_spending_transaction_was_recorded"
);
spending_event!(
    SpendingLimitUpdated,
    LimitUpdated,
    "monthly_spending_limit_was_updated"
);
spending_event!(
    ThresholdReached,
    ThresholdReached,
    "monthly_spending_threshold_was_reached"
);

/// Spending state rebuilt from its stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Spending {
    id: Option<SpendingId>,
    starting_balance: Decimal,
    current_balance: Decimal,
    desired_balance: Decimal,
    spending_limit: Decimal,
    thresholds: Thresholds,
    last_triggered_threshold: Option<Threshold>,
}

impl Spending {
    /// The spending id, once started.
    pub const fn id(&self) -> Option<&SpendingId> {
        self.id.as_ref()
    }

    /// Balance when tracking started.
    pub const fn starting_balance(&self) -> Decimal {
        self.starting_balance
    }

    /// Balance after every recorded transaction.
    pub const fn current_balance(&self) -> Decimal {
        self.current_balance
    }

    /// Starting balance plus the goal amount.
    pub const fn desired_balance(&self) -> Decimal {
        self.desired_balance
    }

    /// Headroom established by the latest deposit.
    pub const fn spending_limit(&self) -> Decimal {
        self.spending_limit
    }

    /// Highest threshold already reported this month.
    pub const fn last_triggered_threshold(&self) -> Option<Threshold> {
        self.last_triggered_threshold
    }

    /// Begins tracking `month` for an account holding `starting_balance`.
    ///
    /// A second start for the same month is rejected when saved, since the
    /// stream must be new.
    pub fn start(
        account_id: AccountId,
        month: CalendarMonth,
        starting_balance: Decimal,
        goal: &SavingGoal,
    ) -> Result<SpendingTrackingStarted, SpendingError> {
        let desired_balance = starting_balance
            .checked_add(goal.amount)
            .ok_or(SpendingError::AmountOverflow)?;
        Ok(SpendingTrackingStarted {
            id: SpendingId::new(account_id, month),
            starting_balance,
            desired_balance,
            thresholds: goal.thresholds.clone(),
        })
    }

    /// Counts a transaction against the month.
    ///
    /// Always yields the transaction event. A deposit may additionally move
    /// the spending limit; a withdrawal may report the highest newly crossed
    /// threshold.
    pub fn record_transaction(&self, amount: Decimal) -> Result<Vec<SpendingEvent>, SpendingError> {
        if self.id.is_none() {
            return Err(SpendingError::NotStarted);
        }

        let new_balance = self
            .current_balance
            .checked_add(amount)
            .ok_or(SpendingError::AmountOverflow)?;
        let mut events = vec![SpendingTransactionRecorded { amount }.into()];

        if amount > Decimal::ZERO {
            let spending_limit = new_balance
                .checked_sub(self.desired_balance)
                .ok_or(SpendingError::AmountOverflow)?;
            if spending_limit != self.spending_limit {
                events.push(SpendingLimitUpdated { spending_limit }.into());
            }
        } else if let Some(threshold) = self.crossed_threshold(new_balance) {
            events.push(ThresholdReached { threshold }.into());
        }

        Ok(events)
    }

    /// Highest threshold above the last reported one that the spent share
    /// has reached. No limit established yet means nothing can be crossed,
    /// and neither does a share too large to compute.
    fn crossed_threshold(&self, new_balance: Decimal) -> Option<Threshold> {
        let current_percentage = new_balance
            .checked_sub(self.desired_balance)?
            .checked_div(self.spending_limit)?;
        self.thresholds
            .iter()
            .rev()
            .copied()
            .filter(|t| self.last_triggered_threshold.is_none_or(|last| *t > last))
            .find(|t| current_percentage >= t.into_inner())
    }
}

impl Aggregate for Spending {
    const TYPE_NAME: &'static str = "monthly-spending";
    type Id = SpendingId;

    fn apply(&mut self, event: &DomainEvent) -> Result<(), UnsupportedEvent> {
        let DomainEvent::Spending(event) = event else {
            return Err(Self::unsupported(event));
        };
        match event {
            SpendingEvent::TrackingStarted(e) => {
                *self = Self {
                    id: Some(e.id.clone()),
                    starting_balance: e.starting_balance,
                    current_balance: e.starting_balance,
                    desired_balance: e.desired_balance,
                    spending_limit: Decimal::ZERO,
                    thresholds: e.thresholds.clone(),
                    last_triggered_threshold: None,
                };
            }
            SpendingEvent::TransactionRecorded(e) => {
                self.current_balance = self.current_balance.saturating_add(e.amount);
            }
            SpendingEvent::LimitUpdated(e) => self.spending_limit = e.spending_limit,
            SpendingEvent::ThresholdReached(e) => {
                self.last_triggered_threshold =
                    Some(self.last_triggered_threshold.map_or(e.threshold, |last| last.max(e.threshold)));
            }
        }
        Ok(())
    }
}
