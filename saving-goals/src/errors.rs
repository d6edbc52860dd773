//! Error types for the saving goals core.
//!
//! Each layer has its own error enum:
//!
//! - **EventStoreError**: storage failures, including optimistic concurrency conflicts
//! - **RegistryError**: unknown or undecodable event types
//! - **CommandError**: everything a command handler can report, with the
//!   aggregates' domain errors carried unchanged
//! - **ProjectionError**: the read model received an event it cannot place
//!
//! Subscription failures live in [`crate::subscription::SubscriptionError`].

use crate::domain::account::AccountError;
use crate::domain::spending::SpendingError;
use crate::types::{EventVersion, StreamId, StreamIdError};
use thiserror::Error;

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// A version conflict occurred when writing events.
    #[error(
        "Version conflict on stream '{stream}': expected {expected}, but current is {current}"
    )]
    VersionConflict {
        /// The stream with the version conflict
        stream: StreamId,
        /// The version that was expected
        expected: EventVersion,
        /// The actual current version
        current: EventVersion,
    },

    /// The event store is temporarily unavailable.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventStoreError {
    /// Whether retrying the same operation later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors raised by the [`EventRegistry`](crate::registry::EventRegistry).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No decoder is registered under this name.
    #[error("Unknown event type: {type_name}")]
    UnknownEventType {
        /// The unregistered type name
        type_name: String,
    },

    /// The name is already taken by another registration.
    #[error("Event type '{type_name}' is already registered")]
    TypeNameConflict {
        /// The conflicting type name
        type_name: String,
    },

    /// The payload could not be decoded into the registered type.
    #[error("Failed to decode event of type '{type_name}': {source}")]
    DeserializationFailed {
        /// The type name that failed to decode
        type_name: String,
        /// The underlying error
        source: serde_json::Error,
    },

    /// The event could not be encoded.
    #[error("Failed to encode event of type '{type_name}': {source}")]
    SerializationFailed {
        /// The type name that failed to encode
        type_name: String,
        /// The underlying error
        source: serde_json::Error,
    },
}

/// An event was applied to an aggregate that does not own it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Event '{event_type}' is not supported by aggregate '{aggregate}'")]
pub struct UnsupportedEvent {
    /// The aggregate that rejected the event
    pub aggregate: &'static str,
    /// Registered name of the rejected event
    pub event_type: &'static str,
}

/// Errors that can occur during command handling.
///
/// Domain rule violations surface through [`CommandError::Account`] and
/// [`CommandError::Spending`] exactly as the aggregates raised them;
/// [`CommandError::is_validation`] tells a boundary which errors are the
/// caller's fault.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The account aggregate rejected the command.
    #[error(transparent)]
    Account(#[from] AccountError),

    /// The spending aggregate rejected the command.
    #[error(transparent)]
    Spending(#[from] SpendingError),

    /// The command targets a stream with no events.
    #[error("Aggregate not found in stream '{stream}'")]
    AggregateNotFound {
        /// The empty stream
        stream: StreamId,
    },

    /// Another writer appended to the stream first.
    #[error("Concurrency conflict on stream '{stream}'")]
    ConcurrencyConflict {
        /// The stream that had a version conflict
        stream: StreamId,
    },

    /// A stream history contains an event its aggregate cannot apply.
    #[error(transparent)]
    UnsupportedEvent(#[from] UnsupportedEvent),

    /// A stream identifier could not be derived from the aggregate id.
    #[error("Invalid stream id: {0}")]
    InvalidStreamId(#[from] StreamIdError),

    /// Encoding or decoding an event failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// An error occurred in the event store while handling the command.
    #[error("Event store error: {0}")]
    EventStore(EventStoreError),
}

impl CommandError {
    /// True for errors caused by the command input rather than the system.
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Account(_) | Self::Spending(_))
    }
}

impl From<EventStoreError> for CommandError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::VersionConflict { stream, .. } => Self::ConcurrencyConflict { stream },
            other => Self::EventStore(other),
        }
    }
}

/// Errors raised while updating a read model.
#[derive(Debug, Clone, Error)]
pub enum ProjectionError {
    /// The event was delivered from a stream the projection does not track.
    #[error("Event '{event_type}' from stream '{stream}' cannot be projected")]
    UnexpectedEvent {
        /// Stream the event came from
        stream: StreamId,
        /// Registered name of the event
        event_type: &'static str,
    },
}

/// Type alias for event store operation results.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Type alias for command handling results.
pub type CommandResult<T> = Result<T, CommandError>;

/// Type alias for projection results.
pub type ProjectionResult<T> = Result<T, ProjectionError>;
