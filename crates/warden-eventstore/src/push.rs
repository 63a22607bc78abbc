//! The append pipeline.
//!
//! One push is one SQLite `IMMEDIATE` transaction: it holds the single
//! writer lock from the sequence re-read until commit, so sequence checks,
//! position allocation, event insert and unique directives see no
//! interleaved writer. Any error drops the transaction, which rolls it back.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use warden_types::{Error, InstanceId, Result};

use crate::deadline::Deadline;
use crate::error::{is_constraint_violation, storage_error};
use crate::event::{format_timestamp, AggregateKey, Command, Position, StoredEvent};
use crate::registry::EventRegistry;
use crate::retry::Clock;
use crate::unique::UniqueConstraint;
use crate::{fields, unique};

/// Optimistic-concurrency expectation for one aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expected {
    /// Append regardless of the current sequence.
    #[default]
    Any,
    /// The aggregate's latest sequence must be exactly this; 0 means the
    /// aggregate must not exist yet.
    Exactly(u64),
    /// The aggregate's latest sequence must be at least this.
    AtLeast(u64),
}

impl Expected {
    /// Expectation for an aggregate that must not exist yet.
    pub const NEW: Expected = Expected::Exactly(0);

    fn check(self, key: &AggregateKey, current: u64) -> Result<()> {
        let ok = match self {
            Expected::Any => true,
            Expected::Exactly(expected) => current == expected,
            Expected::AtLeast(expected) => current >= expected,
        };
        if ok {
            return Ok(());
        }
        Err(Error::conflict(format!(
            "aggregate {key} was modified concurrently: expected {self:?}, found sequence {current}"
        )))
    }
}

/// Everything one push appends, with its expectations.
#[derive(Debug, Clone)]
pub struct PushIntent {
    instance_id: InstanceId,
    commands: Vec<Command>,
    expectations: Vec<(AggregateKey, Expected)>,
    deadline: Deadline,
}

impl PushIntent {
    pub fn new(instance_id: impl Into<InstanceId>) -> Self {
        Self {
            instance_id: instance_id.into(),
            commands: Vec::new(),
            expectations: Vec::new(),
            deadline: Deadline::NONE,
        }
    }

    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn commands(mut self, commands: impl IntoIterator<Item = Command>) -> Self {
        self.commands.extend(commands);
        self
    }

    /// Sets the expectation for the aggregate's stream. An expectation for
    /// an aggregate without commands guards the push without appending to it.
    pub fn expect(mut self, aggregate: &crate::event::Aggregate, expected: Expected) -> Self {
        let key = aggregate.key();
        match self.expectations.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = expected,
            None => self.expectations.push((key, expected)),
        }
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn current_deadline(&self) -> Deadline {
        self.deadline
    }

    /// Checks everything that does not need storage.
    pub(crate) fn validate<E>(&self, registry: &EventRegistry<E>) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(Error::invalid_argument("push requires an instance"));
        }
        for command in &self.commands {
            let aggregate = &command.aggregate;
            if aggregate.instance_id != self.instance_id {
                return Err(Error::invalid_argument(format!(
                    "command for instance {} pushed to instance {}",
                    aggregate.instance_id, self.instance_id
                )));
            }
            if aggregate.aggregate_type.is_empty()
                || aggregate.id.is_empty()
                || aggregate.resource_owner.is_empty()
                || command.event_type.is_empty()
            {
                return Err(Error::invalid_argument(
                    "command requires aggregate type, aggregate id, resource owner and event type",
                ));
            }
            match registry.try_decode(&command.provisional()) {
                None => {
                    return Err(Error::invalid_argument(format!(
                        "event type {}/{} is not registered",
                        aggregate.aggregate_type, command.event_type
                    )))
                }
                Some(Err(err)) => {
                    return Err(
                        Error::invalid_argument(format!("invalid payload for {}", command.event_type))
                            .with_source(err),
                    )
                }
                Some(Ok(_)) => {}
            }
        }
        Ok(())
    }
}

/// Head of one aggregate's stream as seen inside the push transaction.
#[derive(Debug)]
struct StreamHead {
    sequence: u64,
    /// Owner pinned by the aggregate's first event.
    owner: Option<String>,
}

/// Runs the push inside one write transaction and returns the persisted
/// events in push order.
pub(crate) fn push_blocking(
    conn: &mut Connection,
    clock: &dyn Clock,
    intent: &PushIntent,
) -> Result<Vec<StoredEvent>> {
    let mut tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(storage_error)?;

    let mut heads: HashMap<AggregateKey, StreamHead> = HashMap::new();
    let keys = intent
        .commands
        .iter()
        .map(|c| c.aggregate.key())
        .chain(intent.expectations.iter().map(|(k, _)| k.clone()));
    for key in keys {
        if !heads.contains_key(&key) {
            let head = stream_head(&tx, &key)?;
            heads.insert(key, head);
        }
    }

    for (key, expected) in &intent.expectations {
        let current = heads.get(key).map_or(0, |h| h.sequence);
        expected.check(key, current)?;
    }

    let position = next_position(&tx, clock)?;
    let created_at = clock.now();
    let created_at_text = format_timestamp(created_at);

    let mut persisted = Vec::with_capacity(intent.commands.len());
    for (in_tx_order, command) in intent.commands.iter().enumerate() {
        let key = command.aggregate.key();
        let head = heads
            .get_mut(&key)
            .ok_or_else(|| Error::internal("stream head missing for pushed aggregate"))?;
        head.sequence += 1;
        let owner = head
            .owner
            .get_or_insert_with(|| command.aggregate.resource_owner.clone())
            .clone();
        if owner != command.aggregate.resource_owner {
            tracing::debug!(
                aggregate = %key,
                requested_owner = %command.aggregate.resource_owner,
                owner = %owner,
                "resource owner pinned by first event"
            );
        }

        let in_tx_order = u32::try_from(in_tx_order)
            .map_err(|_| Error::invalid_argument("too many events in one push"))?;
        let payload = command
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::invalid_argument("payload cannot be serialized").with_source(e))?;

        let inserted = tx.execute(
            "INSERT INTO events
                (instance_id, aggregate_type, aggregate_id, sequence, owner, event_type,
                 revision, creator, payload, position, in_tx_order, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                key.instance_id.as_str(),
                key.aggregate_type,
                key.aggregate_id,
                head.sequence,
                owner,
                command.event_type,
                command.revision,
                command.creator,
                payload,
                position.to_micros(),
                in_tx_order,
                created_at_text,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(Error::conflict(format!(
                    "sequence {} of aggregate {key} already taken",
                    head.sequence
                ))
                .with_source(e))
            }
            Err(e) => return Err(storage_error(e)),
        }

        let mut aggregate = command.aggregate.clone();
        aggregate.resource_owner = owner;
        persisted.push(StoredEvent {
            aggregate,
            event_type: command.event_type.clone(),
            sequence: head.sequence,
            position,
            in_tx_order,
            created_at,
            creator: command.creator.clone(),
            revision: command.revision,
            payload: command.payload.clone(),
        });
    }

    let directives: Vec<&UniqueConstraint> = intent
        .commands
        .iter()
        .flat_map(|c| c.unique_constraints.iter())
        .collect();
    if !directives.is_empty() {
        unique::check(&tx, &intent.instance_id, &directives)?;
        unique::apply(&tx, &intent.instance_id, &directives)?;
    }

    for (command, event) in intent.commands.iter().zip(&persisted) {
        if command.field_operations.is_empty() {
            continue;
        }
        let savepoint = tx.savepoint().map_err(storage_error)?;
        let key = event.aggregate.key();
        match fields::apply(
            &savepoint,
            &key,
            &event.aggregate.resource_owner,
            &command.field_operations,
        ) {
            Ok(()) => savepoint.commit().map_err(storage_error)?,
            Err(err) => {
                // Dropping the savepoint rolls back only the field writes.
                tracing::warn!(
                    aggregate = %key,
                    event_type = %event.event_type,
                    error = %err,
                    "search fields not updated"
                );
            }
        }
    }

    intent.deadline.check()?;
    tx.commit().map_err(storage_error)?;

    tracing::debug!(
        instance_id = %intent.instance_id,
        events = persisted.len(),
        position = %position,
        "events pushed"
    );
    Ok(persisted)
}

fn stream_head(conn: &Connection, key: &AggregateKey) -> Result<StreamHead> {
    let head = conn
        .query_row(
            "SELECT sequence, owner FROM events
             WHERE instance_id = ?1 AND aggregate_type = ?2 AND aggregate_id = ?3
             ORDER BY sequence DESC LIMIT 1",
            params![key.instance_id.as_str(), key.aggregate_type, key.aggregate_id],
            |row| Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .map_err(storage_error)?;
    Ok(match head {
        Some((sequence, owner)) => StreamHead {
            sequence,
            owner: Some(owner),
        },
        None => StreamHead {
            sequence: 0,
            owner: None,
        },
    })
}

/// Allocates the push position: the clock in micro-units, bumped past the
/// log's current maximum so positions strictly increase in commit order.
fn next_position(conn: &Connection, clock: &dyn Clock) -> Result<Position> {
    let last: Option<i64> = conn
        .query_row("SELECT MAX(position) FROM events", [], |row| row.get(0))
        .map_err(storage_error)?;
    let now = clock.now().timestamp_micros();
    let next = match last {
        Some(last) => now.max(last.saturating_add(1)),
        None => now,
    };
    Ok(Position::from_micros(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::ErrorKind;

    fn key(seq_id: &str) -> AggregateKey {
        AggregateKey {
            instance_id: InstanceId::new("i1"),
            aggregate_type: "user".into(),
            aggregate_id: seq_id.into(),
        }
    }

    #[test]
    fn expectations() {
        let k = key("u1");
        assert!(Expected::Any.check(&k, 7).is_ok());
        assert!(Expected::NEW.check(&k, 0).is_ok());
        assert!(Expected::Exactly(2).check(&k, 2).is_ok());
        assert!(Expected::AtLeast(2).check(&k, 5).is_ok());

        let err = Expected::NEW.check(&k, 1).expect_err("aggregate exists");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = Expected::AtLeast(3).check(&k, 2).expect_err("behind");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn later_expectation_replaces_earlier() {
        let aggregate = crate::event::Aggregate::new("i1", "o1", "user", "u1");
        let intent = PushIntent::new("i1")
            .expect(&aggregate, Expected::NEW)
            .expect(&aggregate, Expected::Exactly(4));
        assert_eq!(intent.expectations, vec![(aggregate.key(), Expected::Exactly(4))]);
    }
}
