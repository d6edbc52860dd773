//! Core types shared by the event store, aggregates and subscriptions.
//!
//! All identifiers use smart constructors so that a value, once built, is
//! always valid.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one event stream, e.g. `account-alice`.
///
/// Guaranteed to be non-empty and at most 255 characters after trimming.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
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
pub struct StreamId(String);

/// Globally unique event identifier (`UUIDv7`, so it sorts by creation time).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Version of a stream: the number of events it holds.
///
/// An empty stream is at version 0; the first event is written as version 1.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct EventVersion(u64);

impl EventVersion {
    /// The version of a stream with no events.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Returns the version following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

/// Position of an event in the store-wide commit order, starting at 1.
///
/// Subscriptions checkpoint against this value.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct GlobalPosition(u64);

impl GlobalPosition {
    /// The first position ever assigned.
    pub fn first() -> Self {
        Self::new(1)
    }

    /// Returns the position following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

/// A timestamp for when an event occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn stream_id_accepts_valid_strings(s in "[a-zA-Z0-9:_-]{1,255}") {
            let stream_id = StreamId::try_new(s.clone()).unwrap();
            prop_assert_eq!(stream_id.as_ref(), &s);
        }

        #[test]
        fn stream_id_trims_whitespace(s in " {0,10}[a-z0-9-]{1,200} {0,10}") {
            let stream_id = StreamId::try_new(s.clone()).unwrap();
            prop_assert_eq!(stream_id.as_ref(), s.trim());
        }

        #[test]
        fn stream_id_rejects_too_long(s in "[a-z]{256,300}") {
            prop_assert!(StreamId::try_new(s).is_err());
        }

        #[test]
        fn event_version_next_is_strictly_greater(v in 0u64..u64::MAX) {
            let version = EventVersion::new(v);
            prop_assert!(version.next() > version);
        }
    }

    #[test]
    fn stream_id_rejects_blank() {
        assert!(StreamId::try_new("   ").is_err());
        assert!(StreamId::try_new("").is_err());
    }

    #[test]
    fn generated_event_ids_are_v7() {
        let id = EventId::generate();
        assert_eq!(id.as_ref().get_version(), Some(uuid::Version::SortRand));
        assert_ne!(id, EventId::generate());
    }

    #[test]
    fn global_positions_start_at_one() {
        assert_eq!(GlobalPosition::first().into_inner(), 1);
        assert_eq!(GlobalPosition::first().next().into_inner(), 2);
    }

    #[test]
    fn timestamp_round_trips_through_datetime() {
        let now = Utc::now();
        let ts = Timestamp::from(now);
        assert_eq!(DateTime::<Utc>::from(ts), now);
        assert_eq!(ts.to_string(), now.to_string());
    }
}
