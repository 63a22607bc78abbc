//! Aggregate identity, persisted events and the commands that create them.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use warden_types::{Error, InstanceId, Result};

use crate::error::DecodeError;
use crate::fields::FieldOperation;
use crate::unique::UniqueConstraint;

/// Identity of an aggregate: the unit of consistency.
///
/// `instance_id` is the tenant boundary, `resource_owner` the organization
/// scope inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    pub instance_id: InstanceId,
    pub resource_owner: String,
    pub aggregate_type: String,
    pub id: String,
}

impl Aggregate {
    pub fn new(
        instance_id: impl Into<InstanceId>,
        resource_owner: impl Into<String>,
        aggregate_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            resource_owner: resource_owner.into(),
            aggregate_type: aggregate_type.into(),
            id: id.into(),
        }
    }

    /// The key the store uses to look up the aggregate's event stream.
    ///
    /// The resource owner is not part of it: it is pinned by the first event.
    pub fn key(&self) -> AggregateKey {
        AggregateKey {
            instance_id: self.instance_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.id.clone(),
        }
    }
}

/// Stream identity of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    pub instance_id: InstanceId,
    pub aggregate_type: String,
    pub aggregate_id: String,
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.instance_id, self.aggregate_type, self.aggregate_id
        )
    }
}

/// Fractional digits kept by a [`Position`]: microseconds.
const POSITION_SCALE: u32 = 6;

/// Global, totally ordered position of a push.
///
/// A decimal number of seconds since the Unix epoch with microsecond
/// precision. Every event of one push shares the position and is ordered
/// within it by `in_tx_order`. Persisted as integer micro-units so SQLite
/// compares it exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(Decimal);

impl Position {
    pub const ZERO: Position = Position(Decimal::ZERO);

    pub fn from_micros(micros: i64) -> Self {
        Self(Decimal::new(micros, POSITION_SCALE))
    }

    /// Integer micro-units, the persisted representation.
    pub fn to_micros(self) -> i64 {
        let mut value = self.0;
        value.rescale(POSITION_SCALE);
        i64::try_from(value.mantissa()).unwrap_or(i64::MAX)
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }
}

impl From<Decimal> for Position {
    fn from(value: Decimal) -> Self {
        let mut value = value;
        value.rescale(POSITION_SCALE);
        Self(value)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An event as persisted in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub aggregate: Aggregate,
    /// Dotted hierarchical name, e.g. `user.human.added`.
    pub event_type: String,
    /// Per-aggregate counter, starting at 1 with no gaps.
    pub sequence: u64,
    pub position: Position,
    /// Index of the event inside its push.
    pub in_tx_order: u32,
    pub created_at: DateTime<Utc>,
    /// User or service that caused the event.
    pub creator: String,
    /// Schema revision of the payload.
    pub revision: u16,
    pub payload: Option<serde_json::Value>,
}

impl StoredEvent {
    /// Parses the payload into its declared shape.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> std::result::Result<T, DecodeError> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| DecodeError::MissingPayload(self.event_type.clone()))?;
        serde_json::from_value(payload).map_err(|source| DecodeError::Payload {
            event_type: self.event_type.clone(),
            source,
        })
    }
}

/// Formats a timestamp the way `created_at` is persisted: fixed-width
/// RFC 3339 with microseconds, so text comparison follows time order.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A not-yet-persisted event submitted to the push pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub aggregate: Aggregate,
    pub event_type: String,
    pub revision: u16,
    pub creator: String,
    pub payload: Option<serde_json::Value>,
    pub unique_constraints: Vec<UniqueConstraint>,
    pub field_operations: Vec<FieldOperation>,
}

impl Command {
    /// A command without payload, constraints or field operations.
    pub fn new(
        aggregate: Aggregate,
        creator: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            aggregate,
            event_type: event_type.into(),
            revision: 1,
            creator: creator.into(),
            payload: None,
            unique_constraints: Vec::new(),
            field_operations: Vec::new(),
        }
    }

    /// Builds the command for a typed domain event.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the aggregate type does not belong to the
    /// event's family or the payload cannot be serialized.
    pub fn from_event<F: EventFamily>(
        aggregate: Aggregate,
        creator: impl Into<String>,
        event: &F,
    ) -> Result<Self> {
        if aggregate.aggregate_type != F::AGGREGATE_TYPE {
            return Err(Error::invalid_argument(format!(
                "event {} belongs to aggregate type {}, not {}",
                event.event_type(),
                F::AGGREGATE_TYPE,
                aggregate.aggregate_type
            )));
        }
        let payload = event.payload().map_err(|e| {
            Error::invalid_argument("event payload cannot be serialized").with_source(e)
        })?;
        let unique_constraints = event.unique_constraints(&aggregate);
        let field_operations = event.field_operations(&aggregate);
        Ok(Self {
            event_type: event.event_type().to_string(),
            revision: F::REVISION,
            creator: creator.into(),
            payload,
            unique_constraints,
            field_operations,
            aggregate,
        })
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        let value = serde_json::to_value(payload).map_err(|e| {
            Error::invalid_argument("event payload cannot be serialized").with_source(e)
        })?;
        self.payload = Some(value);
        Ok(self)
    }

    pub fn with_unique_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }

    pub fn with_field_operation(mut self, operation: FieldOperation) -> Self {
        self.field_operations.push(operation);
        self
    }

    /// The provisional envelope used to validate the payload before it is
    /// appended. Ordering metadata is zero.
    pub(crate) fn provisional(&self) -> StoredEvent {
        StoredEvent {
            aggregate: self.aggregate.clone(),
            event_type: self.event_type.clone(),
            sequence: 0,
            position: Position::ZERO,
            in_tx_order: 0,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            creator: self.creator.clone(),
            revision: self.revision,
            payload: self.payload.clone(),
        }
    }
}

/// The event vocabulary of one aggregate type, modelled as a tagged union.
///
/// Implemented by each domain module's event enum. The registry maps every
/// name in [`EVENT_TYPES`](EventFamily::EVENT_TYPES) to [`decode`](EventFamily::decode).
pub trait EventFamily: Sized + Send + 'static {
    /// Aggregate type all events of the family belong to.
    const AGGREGATE_TYPE: &'static str;

    /// Every event type name the family can decode.
    const EVENT_TYPES: &'static [&'static str];

    /// Payload schema revision written with new events.
    const REVISION: u16 = 1;

    /// Dotted name of this event.
    fn event_type(&self) -> &'static str;

    /// The payload to persist, `None` for payload-less events.
    fn payload(&self) -> serde_json::Result<Option<serde_json::Value>>;

    /// Decodes a stored event of this family.
    fn decode(event: &StoredEvent) -> std::result::Result<Self, DecodeError>;

    /// Unique-constraint directives produced when the event is appended.
    fn unique_constraints(&self, _aggregate: &Aggregate) -> Vec<UniqueConstraint> {
        Vec::new()
    }

    /// Search-field operations produced when the event is appended.
    fn field_operations(&self, _aggregate: &Aggregate) -> Vec<FieldOperation> {
        Vec::new()
    }
}
