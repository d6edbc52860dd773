//! Saving goals - event-sourced monthly spending tracking
//!
//! Accounts carry a saving goal: an amount to keep aside plus percentage
//! thresholds. At the start of every month each account whose balance covers
//! its goal starts a spending tracker; every account transaction is mirrored
//! into the tracker of its month, which raises a notification event once the
//! money left above the goal drops to a threshold.
//!
//! The crate holds the domain (aggregates, commands, process managers, the
//! `AccountsWithSavingGoals` read model) and the event store abstraction it
//! runs on. Storage backends live in separate crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod commands;
pub mod domain;
pub mod errors;
pub mod event_store;
pub mod policy;
pub mod projection;
pub mod registry;
pub mod shutdown;
pub mod subscription;
pub mod types;

pub use aggregate::{Aggregate, AggregateRoot, Committed, Repository};
pub use commands::{Command, CommandBus, CommandDispatcher};
pub use domain::DomainEvent;
pub use errors::{CommandError, EventStoreError};
pub use event_store::{EventStore, ExpectedVersion, SerializedEvent, StoredEvent};
pub use projection::{AccountsWithSavingGoals, AccountsWithSavingGoalsQuery};
pub use registry::EventRegistry;
pub use shutdown::{CancellationHandle, CancellationSignal};
pub use subscription::{EventHandler, SubscriptionRunner, Supervisor};
pub use types::{EventVersion, GlobalPosition, StreamId, Timestamp};
