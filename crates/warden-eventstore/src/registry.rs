//! Event-type registry: maps `(aggregate type, event type)` to a decoder.
//!
//! Built once at startup through [`RegistryBuilder`] and then shared
//! read-only with the store and every consumer. There is no way to mutate a
//! built registry.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::DecodeError;
use crate::event::{EventFamily, StoredEvent};

type Decoder<E> = Arc<dyn Fn(&StoredEvent) -> Result<E, DecodeError> + Send + Sync>;

/// Collects decoders during startup.
pub struct RegistryBuilder<E> {
    decoders: HashMap<(String, String), Decoder<E>>,
}

impl<E: 'static> RegistryBuilder<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers a decoder for one event type.
    ///
    /// # Panics
    ///
    /// Panics if a decoder for the same key is already registered. A
    /// duplicate is a wiring mistake that must stop the process at startup.
    pub fn register<D>(&mut self, aggregate_type: &str, event_type: &str, decoder: D) -> &mut Self
    where
        D: Fn(&StoredEvent) -> Result<E, DecodeError> + Send + Sync + 'static,
    {
        let key = (aggregate_type.to_string(), event_type.to_string());
        if self.decoders.contains_key(&key) {
            panic!("event mapper for {aggregate_type}/{event_type} registered twice");
        }
        self.decoders.insert(key, Arc::new(decoder));
        self
    }

    /// Registers every event type of a family, wrapping decoded events into
    /// the application's event sum type.
    pub fn register_family<F: EventFamily>(&mut self, wrap: fn(F) -> E) -> &mut Self {
        for event_type in F::EVENT_TYPES {
            self.register(F::AGGREGATE_TYPE, event_type, move |event| {
                F::decode(event).map(wrap)
            });
        }
        self
    }

    pub fn build(self) -> EventRegistry<E> {
        let aggregate_types = self.decoders.keys().map(|(a, _)| a.clone()).collect();
        tracing::debug!(mappers = self.decoders.len(), "event registry built");
        EventRegistry {
            inner: Arc::new(Inner {
                decoders: self.decoders,
                aggregate_types,
            }),
        }
    }
}

impl<E: 'static> Default for RegistryBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner<E> {
    decoders: HashMap<(String, String), Decoder<E>>,
    aggregate_types: HashSet<String>,
}

/// Read-only decoder table, cheap to clone.
pub struct EventRegistry<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for EventRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("mappers", &self.inner.decoders.len())
            .finish()
    }
}

impl<E> EventRegistry<E> {
    pub fn builder() -> RegistryBuilder<E>
    where
        E: 'static,
    {
        RegistryBuilder::new()
    }

    /// Decodes a stored event into its domain shape.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Unregistered`] if no decoder exists for the key, or the
    /// decoder's own error if the payload does not fit. Both become
    /// `Internal` when converted into the shared error type.
    pub fn decode(&self, event: &StoredEvent) -> Result<E, DecodeError> {
        match self.decoder(&event.aggregate.aggregate_type, &event.event_type) {
            Some(decoder) => decoder(event),
            None => Err(DecodeError::Unregistered {
                aggregate_type: event.aggregate.aggregate_type.clone(),
                event_type: event.event_type.clone(),
            }),
        }
    }

    /// Like [`decode`](Self::decode) but `None` for unregistered keys.
    pub fn try_decode(&self, event: &StoredEvent) -> Option<Result<E, DecodeError>> {
        self.decoder(&event.aggregate.aggregate_type, &event.event_type)
            .map(|decoder| decoder(event))
    }

    pub fn contains(&self, aggregate_type: &str, event_type: &str) -> bool {
        self.decoder(aggregate_type, event_type).is_some()
    }

    /// Whether any event type of the aggregate type is registered.
    pub fn knows_aggregate(&self, aggregate_type: &str) -> bool {
        self.inner.aggregate_types.contains(aggregate_type)
    }

    pub fn len(&self) -> usize {
        self.inner.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.decoders.is_empty()
    }

    fn decoder(&self, aggregate_type: &str, event_type: &str) -> Option<&Decoder<E>> {
        self.inner
            .decoders
            .get(&(aggregate_type.to_string(), event_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Aggregate, Command};

    #[derive(Debug, PartialEq)]
    enum Light {
        On,
        Dimmed(u8),
    }

    impl EventFamily for Light {
        const AGGREGATE_TYPE: &'static str = "light";
        const EVENT_TYPES: &'static [&'static str] = &["light.on", "light.dimmed"];

        fn event_type(&self) -> &'static str {
            match self {
                Light::On => "light.on",
                Light::Dimmed(_) => "light.dimmed",
            }
        }

        fn payload(&self) -> serde_json::Result<Option<serde_json::Value>> {
            match self {
                Light::On => Ok(None),
                Light::Dimmed(level) => serde_json::to_value(level).map(Some),
            }
        }

        fn decode(event: &StoredEvent) -> Result<Self, DecodeError> {
            match event.event_type.as_str() {
                "light.on" => Ok(Light::On),
                "light.dimmed" => event.unmarshal().map(Light::Dimmed),
                other => Err(DecodeError::UnknownEventType(other.to_string())),
            }
        }
    }

    #[derive(Debug, PartialEq)]
    enum AppEvent {
        Light(Light),
    }

    fn stored(event: &Light) -> StoredEvent {
        Command::from_event(Aggregate::new("i", "o", "light", "l1"), "tester", event)
            .expect("command")
            .provisional()
    }

    #[test]
    fn decodes_registered_family() {
        let mut builder = EventRegistry::<AppEvent>::builder();
        builder.register_family::<Light>(AppEvent::Light);
        let registry = builder.build();

        assert_eq!(registry.len(), 2);
        assert!(registry.knows_aggregate("light"));
        assert!(registry.contains("light", "light.dimmed"));
        let decoded = registry.decode(&stored(&Light::Dimmed(40))).expect("decode");
        assert_eq!(decoded, AppEvent::Light(Light::Dimmed(40)));
    }

    #[test]
    fn unregistered_key_is_reported() {
        let registry = EventRegistry::<AppEvent>::builder().build();
        let err = registry
            .decode(&stored(&Light::On))
            .expect_err("nothing registered");
        assert!(matches!(err, DecodeError::Unregistered { .. }));
        assert!(registry.try_decode(&stored(&Light::On)).is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut builder = EventRegistry::<AppEvent>::builder();
        builder.register_family::<Light>(AppEvent::Light);
        let registry = builder.build();

        let mut event = stored(&Light::Dimmed(1));
        event.payload = Some(serde_json::json!({ "level": "bright" }));
        let err = registry.decode(&event).expect_err("payload shape mismatch");
        assert!(matches!(err, DecodeError::Payload { .. }));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let mut builder = EventRegistry::<AppEvent>::builder();
        builder.register_family::<Light>(AppEvent::Light);
        builder.register_family::<Light>(AppEvent::Light);
    }
}
