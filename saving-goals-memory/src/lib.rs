//! In-memory event store for the saving goals domain
//!
//! This crate provides an in-memory implementation of the `EventStore` trait
//! from the saving-goals crate, useful for testing and for running the
//! service without persistence.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use saving_goals::errors::{EventStoreError, EventStoreResult};
use saving_goals::event_store::{
    EventFilter, EventStore, ExpectedVersion, StoredEvent, StreamData, StreamEvents,
};
use saving_goals::types::{EventVersion, GlobalPosition, StreamId, Timestamp};
use tokio::sync::watch;
use tracing::trace;

struct Log<E> {
    // every event in commit order; index `i` holds position `i + 1`
    events: Vec<StoredEvent<E>>,
    // indices into `events`, per stream
    streams: HashMap<StreamId, Vec<usize>>,
}

impl<E> Log<E> {
    fn version(&self, stream_id: &StreamId) -> Option<EventVersion> {
        self.streams
            .get(stream_id)
            .map(|indices| EventVersion::new(indices.len() as u64))
    }

    fn head(&self) -> Option<GlobalPosition> {
        self.events.last().map(|event| event.position)
    }
}

/// Thread-safe in-memory event store.
///
/// Clones share the same log.
pub struct InMemoryEventStore<E> {
    log: Arc<RwLock<Log<E>>>,
    head: Arc<watch::Sender<Option<GlobalPosition>>>,
}

impl<E> Clone for InMemoryEventStore<E> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            head: Arc::clone(&self.head),
        }
    }
}

impl<E> InMemoryEventStore<E> {
    /// Create a new empty in-memory event store
    pub fn new() -> Self {
        let (head, _) = watch::channel(None);
        Self {
            log: Arc::new(RwLock::new(Log {
                events: Vec::new(),
                streams: HashMap::new(),
            })),
            head: Arc::new(head),
        }
    }

    /// Total number of stored events.
    pub fn len(&self) -> usize {
        self.log.read().events.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.log.read().events.is_empty()
    }
}

impl<E> Default for InMemoryEventStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for InMemoryEventStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.log.read();
        f.debug_struct("InMemoryEventStore")
            .field("events", &log.events.len())
            .field("streams", &log.streams.len())
            .finish()
    }
}

fn check_expected(
    stream_id: &StreamId,
    expected: ExpectedVersion,
    current: Option<EventVersion>,
) -> EventStoreResult<()> {
    let conflict = |expected| EventStoreError::VersionConflict {
        stream: stream_id.clone(),
        expected,
        current: current.unwrap_or_else(EventVersion::initial),
    };
    match expected {
        ExpectedVersion::New if current.is_some() => Err(conflict(EventVersion::initial())),
        ExpectedVersion::Exact(expected)
            if current.unwrap_or_else(EventVersion::initial) != expected =>
        {
            Err(conflict(expected))
        }
        ExpectedVersion::New | ExpectedVersion::Exact(_) | ExpectedVersion::Any => Ok(()),
    }
}

#[async_trait]
impl<E> EventStore for InMemoryEventStore<E>
where
    E: Send + Sync + Clone + 'static,
{
    type Event = E;

    async fn read_streams(
        &self,
        stream_ids: &[StreamId],
    ) -> EventStoreResult<StreamData<Self::Event>> {
        let log = self.log.read();

        let mut indices = Vec::new();
        let mut stream_versions = HashMap::new();

        for stream_id in stream_ids {
            let Some(stream) = log.streams.get(stream_id) else {
                continue;
            };
            stream_versions.insert(stream_id.clone(), EventVersion::new(stream.len() as u64));
            indices.extend_from_slice(stream);
        }

        // commit order across streams
        indices.sort_unstable();
        indices.dedup();

        let events = indices.into_iter().map(|i| log.events[i].clone()).collect();
        Ok(StreamData::new(events, stream_versions))
    }

    async fn read_all(
        &self,
        filter: &EventFilter,
        after: Option<GlobalPosition>,
        limit: usize,
    ) -> EventStoreResult<Vec<StoredEvent<Self::Event>>> {
        let log = self.log.read();
        let start = after.map_or(0, |position| {
            usize::try_from(u64::from(position)).unwrap_or(usize::MAX)
        });

        Ok(log
            .events
            .iter()
            .skip(start)
            .filter(|event| filter.matches(&event.stream_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn write_events_multi(
        &self,
        stream_events: Vec<StreamEvents<Self::Event>>,
    ) -> EventStoreResult<HashMap<StreamId, EventVersion>> {
        let mut log = self.log.write();

        // Verify every expected version before writing anything. A stream
        // named twice is checked against the version its earlier entry leaves.
        let mut pending: HashMap<&StreamId, Option<EventVersion>> = HashMap::new();
        for stream_event in &stream_events {
            let stream_id = &stream_event.stream_id;
            let current = pending
                .get(stream_id)
                .copied()
                .unwrap_or_else(|| log.version(stream_id));
            check_expected(stream_id, stream_event.expected_version, current)?;
            let written = stream_event.events.len() as u64;
            let after = if written == 0 {
                current
            } else {
                Some(EventVersion::new(current.map_or(0, u64::from) + written))
            };
            pending.insert(stream_id, after);
        }
        drop(pending);

        let mut new_versions = HashMap::new();
        let timestamp = Timestamp::now();

        for stream_event in stream_events {
            let StreamEvents {
                stream_id, events, ..
            } = stream_event;
            if events.is_empty() {
                continue;
            }

            let mut version = log
                .version(&stream_id)
                .unwrap_or_else(EventVersion::initial);
            let mut position = log
                .head()
                .map_or_else(GlobalPosition::first, GlobalPosition::next);

            for event in events {
                version = version.next();
                let index = log.events.len();
                log.events.push(StoredEvent {
                    event_id: event.event_id,
                    stream_id: stream_id.clone(),
                    event_version: version,
                    position,
                    timestamp,
                    payload: event.payload,
                });
                log.streams.entry(stream_id.clone()).or_default().push(index);
                position = position.next();
            }

            trace!(%stream_id, %version, "events appended");
            new_versions.insert(stream_id, version);
        }

        // published under the write lock so the head never moves backwards
        self.head.send_replace(log.head());
        Ok(new_versions)
    }

    async fn head_position(&self) -> EventStoreResult<Option<GlobalPosition>> {
        Ok(self.log.read().head())
    }

    async fn wait_for_append(&self, after: Option<GlobalPosition>) -> EventStoreResult<()> {
        let mut receiver = self.head.subscribe();
        receiver
            .wait_for(|head| *head > after)
            .await
            .map(|_| ())
            .map_err(|_| EventStoreError::Unavailable("event store closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use saving_goals::event_store::EventToWrite;
    use std::time::Duration;

    fn stream(name: &str) -> StreamId {
        StreamId::try_new(name).unwrap()
    }

    fn write(stream_id: &StreamId, expected: ExpectedVersion, payloads: &[&str]) -> StreamEvents<String> {
        StreamEvents::new(
            stream_id.clone(),
            expected,
            payloads
                .iter()
                .map(|p| EventToWrite::new((*p).to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        assert!(store.is_empty());
        assert_eq!(store.head_position().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clone_shares_storage() {
        let store1: InMemoryEventStore<String> = InMemoryEventStore::new();
        let store2 = store1.clone();
        assert!(Arc::ptr_eq(&store1.log, &store2.log));

        store2
            .write_events_multi(vec![write(&stream("s"), ExpectedVersion::New, &["a"])])
            .await
            .unwrap();
        assert_eq!(store1.len(), 1);
    }

    async fn version_of(store: &InMemoryEventStore<String>, stream_id: &StreamId) -> Option<EventVersion> {
        store
            .read_streams(std::slice::from_ref(stream_id))
            .await
            .unwrap()
            .stream_version(stream_id)
    }

    #[tokio::test]
    async fn test_unknown_stream_has_no_version() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        let stream_id = stream("test-stream");

        let empty = store.read_streams(&[stream_id.clone()]).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.stream_version(&stream_id), None);

        store
            .write_events_multi(vec![write(&stream_id, ExpectedVersion::New, &["e"])])
            .await
            .unwrap();

        assert_eq!(version_of(&store, &stream_id).await, Some(EventVersion::new(1)));
    }

    #[tokio::test]
    async fn test_read_streams_in_commit_order() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        let (s1, s2) = (stream("stream-1"), stream("stream-2"));

        store
            .write_events_multi(vec![write(&s1, ExpectedVersion::New, &["1a"])])
            .await
            .unwrap();
        store
            .write_events_multi(vec![write(&s2, ExpectedVersion::New, &["2a"])])
            .await
            .unwrap();
        store
            .write_events_multi(vec![write(&s1, ExpectedVersion::Any, &["1b"])])
            .await
            .unwrap();

        let result = store
            .read_streams(&[s1.clone(), s2.clone(), stream("missing")])
            .await
            .unwrap();

        let payloads: Vec<_> = result.events.iter().map(|e| e.payload.as_str()).collect();
        assert_eq!(payloads, vec!["1a", "2a", "1b"]);
        assert_eq!(result.stream_version(&s1), Some(EventVersion::new(2)));
        assert_eq!(result.stream_version(&s2), Some(EventVersion::new(1)));
        assert_eq!(result.stream_version(&stream("missing")), None);
    }

    #[tokio::test]
    async fn test_concurrency_control() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        let stream_id = stream("test-stream");

        store
            .write_events_multi(vec![write(&stream_id, ExpectedVersion::New, &["event-1"])])
            .await
            .unwrap();

        // stale version
        let result = store
            .write_events_multi(vec![write(
                &stream_id,
                ExpectedVersion::Exact(EventVersion::initial()),
                &["event-2"],
            )])
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::VersionConflict { current, .. }) if current == EventVersion::new(1)
        ));

        let versions = store
            .write_events_multi(vec![write(
                &stream_id,
                ExpectedVersion::Exact(EventVersion::new(1)),
                &["event-2"],
            )])
            .await
            .unwrap();
        assert_eq!(versions.get(&stream_id), Some(&EventVersion::new(2)));
    }

    #[tokio::test]
    async fn test_expected_version_new() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        let stream_id = stream("test-stream");

        store
            .write_events_multi(vec![write(&stream_id, ExpectedVersion::New, &["event-1"])])
            .await
            .unwrap();
        let result = store
            .write_events_multi(vec![write(&stream_id, ExpectedVersion::New, &["event-2"])])
            .await;
        assert!(matches!(result, Err(EventStoreError::VersionConflict { .. })));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_stream_write_is_atomic() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        let (taken, fresh) = (stream("taken"), stream("fresh"));
        store
            .write_events_multi(vec![write(&taken, ExpectedVersion::New, &["x"])])
            .await
            .unwrap();

        let result = store
            .write_events_multi(vec![
                write(&fresh, ExpectedVersion::New, &["y"]),
                write(&taken, ExpectedVersion::New, &["z"]),
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(version_of(&store, &fresh).await, None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_same_stream_twice_in_one_write_is_checked_in_order() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        let stream_id = stream("twice");

        let result = store
            .write_events_multi(vec![
                write(&stream_id, ExpectedVersion::New, &["a"]),
                write(&stream_id, ExpectedVersion::New, &["b"]),
            ])
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::VersionConflict { current, .. }) if current == EventVersion::new(1)
        ));
        assert!(store.is_empty());

        let versions = store
            .write_events_multi(vec![
                write(&stream_id, ExpectedVersion::New, &["a"]),
                write(&stream_id, ExpectedVersion::Exact(EventVersion::new(1)), &["b", "c"]),
            ])
            .await
            .unwrap();
        assert_eq!(versions.get(&stream_id), Some(&EventVersion::new(3)));
        assert_eq!(version_of(&store, &stream_id).await, Some(EventVersion::new(3)));
    }

    #[tokio::test]
    async fn test_read_all_filters_and_pages() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        for (name, payload) in [("account-a", "a1"), ("calendar-month", "m"), ("account-b", "b1"), ("account-a", "a2")] {
            store
                .write_events_multi(vec![write(&stream(name), ExpectedVersion::Any, &[payload])])
                .await
                .unwrap();
        }

        let filter = EventFilter::prefix("account-");
        let first = store.read_all(&filter, None, 2).await.unwrap();
        let payloads: Vec<_> = first.iter().map(|e| e.payload.as_str()).collect();
        assert_eq!(payloads, vec!["a1", "b1"]);

        let rest = store
            .read_all(&filter, Some(first[1].position), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, "a2");
        assert_eq!(rest[0].position, GlobalPosition::new(4));

        assert!(store
            .read_all(&EventFilter::all(), Some(GlobalPosition::new(99)), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_append_wakes_on_write() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_append(None).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        store
            .write_events_multi(vec![write(&stream("s"), ExpectedVersion::New, &["e"])])
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_append_returns_when_already_past() {
        let store: InMemoryEventStore<String> = InMemoryEventStore::new();
        store
            .write_events_multi(vec![write(&stream("s"), ExpectedVersion::New, &["e"])])
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_millis(100), store.wait_for_append(None))
            .await
            .unwrap()
            .unwrap();
    }

    proptest! {
        #[test]
        fn positions_are_contiguous_and_versions_count_events(
            batches in prop::collection::vec((0_usize..3, 1_usize..4), 1..12)
        ) {
            let store: InMemoryEventStore<String> = InMemoryEventStore::new();
            let names = ["s-0", "s-1", "s-2"];
            let mut expected_counts = [0_u64; 3];

            for (which, count) in &batches {
                let payloads = vec!["e"; *count];
                tokio_test::block_on(store.write_events_multi(vec![write(
                    &stream(names[*which]),
                    ExpectedVersion::Any,
                    &payloads,
                )]))
                .unwrap();
                expected_counts[*which] += *count as u64;
            }

            let all = tokio_test::block_on(store.read_all(&EventFilter::all(), None, usize::MAX)).unwrap();
            for (i, event) in all.iter().enumerate() {
                prop_assert_eq!(u64::from(event.position), i as u64 + 1);
            }
            for (name, count) in names.iter().zip(expected_counts) {
                let version = tokio_test::block_on(version_of(&store, &stream(name)));
                prop_assert_eq!(version.map(u64::from), (count > 0).then_some(count));
            }
        }
    }
}
