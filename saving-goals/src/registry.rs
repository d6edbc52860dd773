//! Explicit event type registry.
//!
//! Maps each registered event type name to a decoder producing a
//! [`DomainEvent`]. The registry is built once at start-up and handed to every
//! component that reads or writes events; there is no global table.

use crate::domain::account::{
    AccountCreated, AccountTransactionRecorded, SavingGoalChanged, SavingGoalDisabled,
    ThresholdSet,
};
use crate::domain::interval::MonthStarted;
use crate::domain::spending::{
    SpendingLimitUpdated, SpendingTrackingStarted, SpendingTransactionRecorded, ThresholdReached,
};
use crate::domain::{DomainEvent, EventType};
use crate::errors::RegistryError;
use crate::event_store::SerializedEvent;
use std::collections::HashMap;
use std::fmt;

type Decoder = fn(serde_json::Value) -> serde_json::Result<DomainEvent>;

fn decode_as<T: EventType>(data: serde_json::Value) -> serde_json::Result<DomainEvent> {
    serde_json::from_value::<T>(data).map(Into::into)
}

/// Registry of event type names and their decoders.
#[derive(Default)]
pub struct EventRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every event of the saving goal domain.
    pub fn saving_goals() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register::<AccountCreated>()?;
        registry.register::<SavingGoalChanged>()?;
        registry.register::<ThresholdSet>()?;
        registry.register::<SavingGoalDisabled>()?;
        registry.register::<AccountTransactionRecorded>()?;
        registry.register::<SpendingTrackingStarted>()?;
        registry.register::<SpendingTransactionRecorded>()?;
        registry.register::<SpendingLimitUpdated>()?;
        registry.register::<ThresholdReached>()?;
        registry.register::<MonthStarted>()?;
        Ok(registry)
    }

    /// Registers `T` under its [`EventType::EVENT_TYPE`] name.
    pub fn register<T: EventType>(&mut self) -> Result<(), RegistryError> {
        if self.decoders.contains_key(T::EVENT_TYPE) {
            return Err(RegistryError::TypeNameConflict {
                type_name: T::EVENT_TYPE.to_string(),
            });
        }
        self.decoders.insert(T::EVENT_TYPE, decode_as::<T>);
        Ok(())
    }

    /// Whether `type_name` has a decoder.
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// All registered names, sorted.
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.decoders.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Encodes an event for storage. Unregistered types are refused so that
    /// nothing is written that could not be read back.
    pub fn encode(&self, event: &DomainEvent) -> Result<SerializedEvent, RegistryError> {
        let type_name = event.event_type();
        if !self.is_registered(type_name) {
            return Err(RegistryError::UnknownEventType {
                type_name: type_name.to_string(),
            });
        }
        let data = event
            .to_json()
            .map_err(|source| RegistryError::SerializationFailed {
                type_name: type_name.to_string(),
                source,
            })?;
        Ok(SerializedEvent {
            event_type: type_name.to_string(),
            data,
        })
    }

    /// Decodes a stored event.
    pub fn decode(&self, event: &SerializedEvent) -> Result<DomainEvent, RegistryError> {
        let decoder = self.decoders.get(event.event_type.as_str()).ok_or_else(|| {
            RegistryError::UnknownEventType {
                type_name: event.event_type.clone(),
            }
        })?;
        decoder(event.data.clone()).map_err(|source| RegistryError::DeserializationFailed {
            type_name: event.event_type.clone(),
            source,
        })
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
