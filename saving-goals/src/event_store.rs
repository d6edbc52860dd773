//! Event store abstraction.
//!
//! The `EventStore` trait is the port every backend implements: per-stream
//! reads with optimistic concurrency on write, plus a store-wide, ordered view
//! used by subscriptions.

use crate::errors::EventStoreResult;
use crate::types::{EventId, EventVersion, GlobalPosition, StreamId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Data returned when reading from one or more streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData<E> {
    /// The events from all requested streams, in commit order
    pub events: Vec<StoredEvent<E>>,
    /// The current version of each stream that was read
    pub stream_versions: HashMap<StreamId, EventVersion>,
}

impl<E> StreamData<E> {
    /// Creates a new `StreamData` instance.
    pub const fn new(
        events: Vec<StoredEvent<E>>,
        stream_versions: HashMap<StreamId, EventVersion>,
    ) -> Self {
        Self {
            events,
            stream_versions,
        }
    }

    /// Returns whether any events were found.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the number of events in the stream data.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Gets the current version of a specific stream.
    pub fn stream_version(&self, stream_id: &StreamId) -> Option<EventVersion> {
        self.stream_versions.get(stream_id).copied()
    }
}

/// An event as it exists in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent<E> {
    /// Unique identifier for this event
    pub event_id: EventId,
    /// The stream this event belongs to
    pub stream_id: StreamId,
    /// The version of this event within its stream
    pub event_version: EventVersion,
    /// Position in the store-wide commit order
    pub position: GlobalPosition,
    /// When this event was stored
    pub timestamp: Timestamp,
    /// The event payload
    pub payload: E,
}

impl<E> StoredEvent<E> {
    /// Replaces the payload, keeping all store metadata.
    pub fn try_map<F, T, Err>(self, f: F) -> Result<StoredEvent<T>, Err>
    where
        F: FnOnce(E) -> Result<T, Err>,
    {
        Ok(StoredEvent {
            event_id: self.event_id,
            stream_id: self.stream_id,
            event_version: self.event_version,
            position: self.position,
            timestamp: self.timestamp,
            payload: f(self.payload)?,
        })
    }
}

/// Store-level representation of a domain event: its registered type name
/// and its JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// Name the event type was registered under
    pub event_type: String,
    /// The encoded event body
    pub data: serde_json::Value,
}

/// Expected version for optimistic concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The stream must not exist
    New,
    /// The stream must exist and have exactly this version
    Exact(EventVersion),
    /// Any version is acceptable (no concurrency control)
    Any,
}

impl From<Option<EventVersion>> for ExpectedVersion {
    fn from(version: Option<EventVersion>) -> Self {
        version.map_or(Self::New, Self::Exact)
    }
}

/// Events to write to a specific stream.
#[derive(Debug, Clone)]
pub struct StreamEvents<E> {
    /// The target stream
    pub stream_id: StreamId,
    /// The expected version for optimistic concurrency control
    pub expected_version: ExpectedVersion,
    /// The events to write
    pub events: Vec<EventToWrite<E>>,
}

impl<E> StreamEvents<E> {
    /// Creates a new `StreamEvents` instance.
    pub const fn new(
        stream_id: StreamId,
        expected_version: ExpectedVersion,
        events: Vec<EventToWrite<E>>,
    ) -> Self {
        Self {
            stream_id,
            expected_version,
            events,
        }
    }
}

/// An event to be written to the event store.
#[derive(Debug, Clone)]
pub struct EventToWrite<E> {
    /// Unique identifier for this event
    pub event_id: EventId,
    /// The event payload
    pub payload: E,
}

impl<E> EventToWrite<E> {
    /// Wraps a payload with a freshly generated id.
    pub fn new(payload: E) -> Self {
        Self {
            event_id: EventId::generate(),
            payload,
        }
    }
}

/// Selects which streams a store-wide read returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    stream_prefix: Option<String>,
}

impl EventFilter {
    /// Matches every stream.
    pub const fn all() -> Self {
        Self {
            stream_prefix: None,
        }
    }

    /// Matches streams whose id starts with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            stream_prefix: Some(prefix.into()),
        }
    }

    /// Whether events of `stream_id` pass this filter.
    pub fn matches(&self, stream_id: &StreamId) -> bool {
        self.stream_prefix
            .as_deref()
            .is_none_or(|prefix| stream_id.as_ref().starts_with(prefix))
    }
}

/// Port implemented by event store backends.
///
/// Writes are atomic across all `StreamEvents` passed in one call, each
/// checked against the version left by the entries before it, and every
/// written event is assigned the next [`GlobalPosition`]. Reads through
/// [`EventStore::read_all`] return events in that order.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Payload type held by this store.
    type Event: Send + Sync;

    /// Reads every event of the given streams in commit order. Streams
    /// without events are absent from the returned versions.
    async fn read_streams(
        &self,
        stream_ids: &[StreamId],
    ) -> EventStoreResult<StreamData<Self::Event>>;

    /// Reads up to `limit` events matching `filter` with a position strictly
    /// after `after` (`None` reads from the beginning).
    async fn read_all(
        &self,
        filter: &EventFilter,
        after: Option<GlobalPosition>,
        limit: usize,
    ) -> EventStoreResult<Vec<StoredEvent<Self::Event>>>;

    /// Writes events to one or more streams atomically.
    async fn write_events_multi(
        &self,
        stream_events: Vec<StreamEvents<Self::Event>>,
    ) -> EventStoreResult<HashMap<StreamId, EventVersion>>;

    /// Position of the most recently written event.
    async fn head_position(&self) -> EventStoreResult<Option<GlobalPosition>>;

    /// Resolves once an event beyond `after` has been written.
    async fn wait_for_append(&self, after: Option<GlobalPosition>) -> EventStoreResult<()>;
}
