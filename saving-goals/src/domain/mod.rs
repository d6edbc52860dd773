//! The saving goal domain: values, aggregates and their events.

pub mod account;
pub mod interval;
pub mod saving;
pub mod spending;

use account::AccountEvent;
use interval::MonthStarted;
use serde::{de::DeserializeOwned, Serialize};
use spending::SpendingEvent;

/// An event payload with a stable, registered type name.
pub trait EventType: Serialize + DeserializeOwned + Into<DomainEvent> {
    /// Name the payload is stored under.
    const EVENT_TYPE: &'static str;
}

/// Every event the system records, grouped by the stream kind that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    /// Recorded on an account stream
    Account(AccountEvent),
    /// Recorded on a monthly spending stream
    Spending(SpendingEvent),
    /// Recorded on the calendar stream
    MonthStarted(MonthStarted),
}

impl DomainEvent {
    /// Registered name of the wrapped payload.
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Account(event) => event.event_type(),
            Self::Spending(event) => event.event_type(),
            Self::MonthStarted(_) => MonthStarted::EVENT_TYPE,
        }
    }

    /// Encodes the wrapped payload as JSON.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Account(event) => event.to_json(),
            Self::Spending(event) => event.to_json(),
            Self::MonthStarted(event) => serde_json::to_value(event),
        }
    }
}

impl From<AccountEvent> for DomainEvent {
    fn from(event: AccountEvent) -> Self {
        Self::Account(event)
    }
}

impl From<SpendingEvent> for DomainEvent {
    fn from(event: SpendingEvent) -> Self {
        Self::Spending(event)
    }
}

impl From<MonthStarted> for DomainEvent {
    fn from(event: MonthStarted) -> Self {
        Self::MonthStarted(event)
    }
}
