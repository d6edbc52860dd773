//! Aggregates and the repository that loads and saves them.
//!
//! An aggregate is rebuilt by replaying its stream onto a default instance.
//! Commands record new events on an [`AggregateRoot`], which applies them
//! immediately and keeps them pending until [`Repository::save`] appends them
//! with an optimistic concurrency check.

use crate::domain::DomainEvent;
use crate::errors::{CommandError, CommandResult, EventStoreError, UnsupportedEvent};
use crate::event_store::{
    EventStore, EventToWrite, ExpectedVersion, SerializedEvent, StreamEvents,
};
use crate::registry::EventRegistry;
use crate::types::{EventVersion, StreamId, StreamIdError};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, instrument};

/// State rebuilt from the events of one stream.
pub trait Aggregate: Default + Send + Sync + 'static {
    /// Stream name prefix, e.g. `account`.
    const TYPE_NAME: &'static str;

    /// Identifier embedded in the stream id.
    type Id: fmt::Display + fmt::Debug + Send + Sync;

    /// Applies one event. Events owned by another aggregate are refused.
    fn apply(&mut self, event: &DomainEvent) -> Result<(), UnsupportedEvent>;

    /// Stream holding the events of the aggregate identified by `id`.
    fn stream_id(id: &Self::Id) -> Result<StreamId, StreamIdError> {
        StreamId::try_new(format!("{}-{id}", Self::TYPE_NAME))
    }

    /// Rebuilds state from a history.
    fn replay<'a, I>(events: I) -> Result<Self, UnsupportedEvent>
    where
        I: IntoIterator<Item = &'a DomainEvent>,
    {
        events.into_iter().try_fold(Self::default(), |mut state, event| {
            state.apply(event)?;
            Ok(state)
        })
    }

    /// The error returned for an event this aggregate does not own.
    fn unsupported(event: &DomainEvent) -> UnsupportedEvent {
        UnsupportedEvent {
            aggregate: Self::TYPE_NAME,
            event_type: event.event_type(),
        }
    }
}

/// An aggregate together with its stream position and unsaved events.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A> {
    stream_id: StreamId,
    state: A,
    version: Option<EventVersion>,
    pending: Vec<DomainEvent>,
}

impl<A: Aggregate> AggregateRoot<A> {
    fn fresh(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            state: A::default(),
            version: None,
            pending: Vec::new(),
        }
    }

    /// The stream this aggregate lives in.
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Current state, including pending events.
    pub const fn state(&self) -> &A {
        &self.state
    }

    /// Stream version at load time, `None` for a stream not yet written.
    pub const fn version(&self) -> Option<EventVersion> {
        self.version
    }

    /// Events recorded since load.
    pub fn pending(&self) -> &[DomainEvent] {
        &self.pending
    }

    /// Applies `event` and queues it for saving.
    pub fn record(&mut self, event: impl Into<DomainEvent>) -> Result<(), UnsupportedEvent> {
        let event = event.into();
        self.state.apply(&event)?;
        self.pending.push(event);
        Ok(())
    }
}

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// The stream written to
    pub stream_id: StreamId,
    /// Stream version after the write
    pub version: EventVersion,
    /// The events appended, in order
    pub events: Vec<DomainEvent>,
}

/// Loads aggregates by replay and saves their pending events.
pub struct Repository<A, S> {
    store: Arc<S>,
    registry: Arc<EventRegistry>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, S> Clone for Repository<A, S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            _aggregate: PhantomData,
        }
    }
}

impl<A, S> Repository<A, S>
where
    A: Aggregate,
    S: EventStore<Event = SerializedEvent>,
{
    /// Creates a repository over `store`, decoding with `registry`.
    pub const fn new(store: Arc<S>, registry: Arc<EventRegistry>) -> Self {
        Self {
            store,
            registry,
            _aggregate: PhantomData,
        }
    }

    /// Starts an aggregate in a stream that must not exist yet.
    pub fn create(&self, id: &A::Id) -> CommandResult<AggregateRoot<A>> {
        Ok(AggregateRoot::fresh(A::stream_id(id)?))
    }

    /// Loads an existing aggregate.
    ///
    /// Fails with [`CommandError::AggregateNotFound`] when the stream is empty.
    #[instrument(skip(self), fields(aggregate = A::TYPE_NAME))]
    pub async fn load(&self, id: &A::Id) -> CommandResult<AggregateRoot<A>> {
        let stream_id = A::stream_id(id)?;
        let data = self
            .store
            .read_streams(std::slice::from_ref(&stream_id))
            .await?;

        if data.is_empty() {
            return Err(CommandError::AggregateNotFound { stream: stream_id });
        }

        let mut state = A::default();
        for stored in &data.events {
            let event = self.registry.decode(&stored.payload)?;
            state.apply(&event)?;
        }

        let version = data.stream_version(&stream_id);
        debug!(stream_id = %stream_id, ?version, events = data.len(), "aggregate loaded");

        Ok(AggregateRoot {
            stream_id,
            state,
            version,
            pending: Vec::new(),
        })
    }

    /// Appends the pending events, expecting the stream to be unchanged since
    /// load. A conflict surfaces as [`CommandError::ConcurrencyConflict`].
    #[instrument(skip(self, root), fields(aggregate = A::TYPE_NAME, stream_id = %root.stream_id))]
    pub async fn save(&self, root: AggregateRoot<A>) -> CommandResult<Committed> {
        let AggregateRoot {
            stream_id,
            version,
            pending,
            ..
        } = root;

        if pending.is_empty() {
            return Ok(Committed {
                stream_id,
                version: version.unwrap_or_else(EventVersion::initial),
                events: pending,
            });
        }

        let to_write = pending
            .iter()
            .map(|event| self.registry.encode(event).map(EventToWrite::new))
            .collect::<Result<Vec<_>, _>>()?;

        let versions = self
            .store
            .write_events_multi(vec![StreamEvents::new(
                stream_id.clone(),
                ExpectedVersion::from(version),
                to_write,
            )])
            .await?;

        let new_version = versions.get(&stream_id).copied().ok_or_else(|| {
            CommandError::EventStore(EventStoreError::Internal(format!(
                "store did not report a version for '{stream_id}'"
            )))
        })?;

        debug!(version = %new_version, events = pending.len(), "events appended");

        Ok(Committed {
            stream_id,
            version: new_version,
            events: pending,
        })
    }
}
