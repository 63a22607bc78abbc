//! Reconstituting domain state from events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use warden_types::{Error, Result};

use crate::event::{AggregateKey, Position, StoredEvent};
use crate::query::SearchQuery;
use crate::registry::EventRegistry;

/// In-memory state derived from an event slice.
///
/// `reduce` must be pure: no I/O, no clock, no randomness. Replaying the
/// same slice into the same initial state must give the same result.
pub trait WriteModel<E> {
    /// The events this model is built from.
    fn query(&self) -> SearchQuery;

    fn reduce(&mut self, event: &StoredEvent, decoded: &E);
}

/// A reduced model and the metadata of the last event it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduced<M> {
    pub model: M,
    /// Sequence of the last consumed event, 0 if none. Pass it as
    /// `Expected::Exactly` on the next push.
    pub processed_sequence: u64,
    pub position: Position,
    /// Owner of the last consumed event.
    pub resource_owner: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
}

impl<M> Reduced<M> {
    /// Whether any event was consumed.
    pub fn exists(&self) -> bool {
        self.processed_sequence > 0
    }
}

/// Folds `events` into `initial`.
///
/// Events of one aggregate must arrive with strictly increasing sequences.
/// Event types the registry does not know are skipped but still count as
/// processed, so the concurrency token matches the stream.
///
/// # Errors
///
/// `Internal` when a known event fails to decode, `InvalidArgument` when the
/// slice is out of order.
pub fn reduce<E, M>(
    registry: &EventRegistry<E>,
    initial: M,
    events: &[StoredEvent],
) -> Result<Reduced<M>>
where
    M: WriteModel<E>,
{
    let mut reduced = Reduced {
        model: initial,
        processed_sequence: 0,
        position: Position::ZERO,
        resource_owner: None,
        changed_at: None,
    };
    let mut last_sequence: HashMap<AggregateKey, u64> = HashMap::new();

    for event in events {
        let key = event.aggregate.key();
        let previous = last_sequence.insert(key, event.sequence).unwrap_or(0);
        if event.sequence <= previous {
            return Err(Error::invalid_argument(format!(
                "events out of order: sequence {} after {} for {}/{}",
                event.sequence, previous, event.aggregate.aggregate_type, event.aggregate.id
            )));
        }

        match registry.try_decode(event) {
            Some(decoded) => {
                let decoded = decoded.map_err(Error::from)?;
                reduced.model.reduce(event, &decoded);
            }
            None => tracing::trace!(
                aggregate_type = %event.aggregate.aggregate_type,
                event_type = %event.event_type,
                "skipping unknown event type"
            ),
        }

        reduced.processed_sequence = event.sequence;
        reduced.position = event.position;
        reduced.resource_owner = Some(event.aggregate.resource_owner.clone());
        reduced.changed_at = Some(event.created_at);
    }
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::event::{Aggregate, Command, EventFamily};
    use warden_types::ErrorKind;

    #[derive(Debug, Clone, PartialEq)]
    enum Counter {
        Added(i64),
        Reset,
    }

    impl EventFamily for Counter {
        const AGGREGATE_TYPE: &'static str = "counter";
        const EVENT_TYPES: &'static [&'static str] = &["counter.added", "counter.reset"];

        fn event_type(&self) -> &'static str {
            match self {
                Counter::Added(_) => "counter.added",
                Counter::Reset => "counter.reset",
            }
        }

        fn payload(&self) -> serde_json::Result<Option<serde_json::Value>> {
            match self {
                Counter::Added(n) => serde_json::to_value(n).map(Some),
                Counter::Reset => Ok(None),
            }
        }

        fn decode(event: &StoredEvent) -> std::result::Result<Self, DecodeError> {
            match event.event_type.as_str() {
                "counter.added" => event.unmarshal().map(Counter::Added),
                "counter.reset" => Ok(Counter::Reset),
                other => Err(DecodeError::UnknownEventType(other.into())),
            }
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Total {
        value: i64,
        applied: u32,
    }

    impl WriteModel<Counter> for Total {
        fn query(&self) -> SearchQuery {
            SearchQuery::for_aggregate(&Aggregate::new("i", "o", "counter", "c1"))
        }

        fn reduce(&mut self, _event: &StoredEvent, decoded: &Counter) {
            self.applied += 1;
            match decoded {
                Counter::Added(n) => self.value += n,
                Counter::Reset => self.value = 0,
            }
        }
    }

    fn registry() -> EventRegistry<Counter> {
        let mut builder = EventRegistry::builder();
        builder.register_family::<Counter>(|c| c);
        builder.build()
    }

    fn stream(events: &[Counter]) -> Vec<StoredEvent> {
        events
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mut stored =
                    Command::from_event(Aggregate::new("i", "o", "counter", "c1"), "t", e)
                        .expect("command")
                        .provisional();
                stored.sequence = i as u64 + 1;
                stored.position = Position::from_micros(i as i64 + 100);
                stored
            })
            .collect()
    }

    #[test]
    fn replay_is_deterministic() {
        let events = stream(&[Counter::Added(3), Counter::Reset, Counter::Added(4)]);
        let a = reduce(&registry(), Total::default(), &events).expect("reduce");
        let b = reduce(&registry(), Total::default(), &events).expect("reduce");
        assert_eq!(a, b);
        assert_eq!(a.model.value, 4);
        assert_eq!(a.processed_sequence, 3);
        assert_eq!(a.position, Position::from_micros(102));
    }

    #[test]
    fn unknown_event_types_are_skipped_but_counted() {
        let mut events = stream(&[Counter::Added(1), Counter::Added(2)]);
        events[1].event_type = "counter.exploded".into();
        let reduced = reduce(&registry(), Total::default(), &events).expect("reduce");
        assert_eq!(reduced.model, Total { value: 1, applied: 1 });
        assert_eq!(reduced.processed_sequence, 2);
    }

    #[test]
    fn undecodable_known_event_is_internal() {
        let mut events = stream(&[Counter::Added(1)]);
        events[0].payload = Some(serde_json::json!("not a number"));
        let err = reduce(&registry(), Total::default(), &events).expect_err("bad payload");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn out_of_order_slice_is_rejected() {
        let mut events = stream(&[Counter::Added(1), Counter::Added(2)]);
        events.swap(0, 1);
        let err = reduce(&registry(), Total::default(), &events).expect_err("unsorted");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn empty_slice_does_not_exist() {
        let reduced = reduce(&registry(), Total::default(), &[]).expect("reduce");
        assert!(!reduced.exists());
        assert_eq!(reduced.model, Total::default());
    }
}
