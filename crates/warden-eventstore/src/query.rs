//! Filter builder for reading the event log.
//!
//! A [`SearchQuery`] is a plain value: building it never touches storage.
//! The store turns it into one parameterised statement; nothing is
//! interpolated into the SQL text.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Row;
use warden_types::{Error, InstanceId, Result};

use crate::event::{format_timestamp, Aggregate, Position, StoredEvent};

/// One `(aggregate types, aggregate ids, event types)` clause.
///
/// Lists inside a clause are OR'd, the lists themselves AND'd. Empty id or
/// event-type lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateFilter {
    aggregate_types: Vec<String>,
    aggregate_ids: Vec<String>,
    event_types: Vec<String>,
}

impl AggregateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn aggregate_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types.extend(types.into_iter().map(Into::into));
        self
    }

    fn push_sql(&self, sql: &mut String, params: &mut Vec<Value>) {
        let mut parts = vec![in_list("aggregate_type", &self.aggregate_types, params)];
        if !self.aggregate_ids.is_empty() {
            parts.push(in_list("aggregate_id", &self.aggregate_ids, params));
        }
        if !self.event_types.is_empty() {
            parts.push(in_list("event_type", &self.event_types, params));
        }
        sql.push('(');
        sql.push_str(&parts.join(" AND "));
        sql.push(')');
    }
}

/// Excludes every aggregate that has at least one of the given events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Exclusion {
    aggregate_types: Vec<String>,
    event_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Projection {
    Events,
    MaxPosition,
    InstanceIds,
}

/// Immutable description of an event-log read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    instance_id: InstanceId,
    all_instances: bool,
    resource_owner: Option<String>,
    filters: Vec<AggregateFilter>,
    creator: Option<String>,
    sequence_greater: Option<u64>,
    sequence_less: Option<u64>,
    position_after: Option<(Position, Option<u32>)>,
    created_after: Option<DateTime<Utc>>,
    exclusion: Option<Exclusion>,
    await_open_transactions: bool,
    descending: bool,
    limit: Option<u64>,
}

impl SearchQuery {
    pub fn new(instance_id: impl Into<InstanceId>) -> Self {
        Self {
            instance_id: instance_id.into(),
            all_instances: false,
            resource_owner: None,
            filters: Vec::new(),
            creator: None,
            sequence_greater: None,
            sequence_less: None,
            position_after: None,
            created_after: None,
            exclusion: None,
            await_open_transactions: false,
            descending: false,
            limit: None,
        }
    }

    /// A query over every instance.
    ///
    /// Only [`Eventstore::instance_ids`](crate::Eventstore::instance_ids)
    /// accepts it; event reads stay scoped to one tenant.
    pub fn across_instances() -> Self {
        Self {
            all_instances: true,
            ..Self::new(InstanceId::new(""))
        }
    }

    /// All events of one aggregate, in sequence order.
    pub fn for_aggregate(aggregate: &Aggregate) -> Self {
        Self::new(aggregate.instance_id.clone()).filter(
            AggregateFilter::new()
                .aggregate_types([aggregate.aggregate_type.as_str()])
                .aggregate_ids([aggregate.id.as_str()]),
        )
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn resource_owner(mut self, owner: impl Into<String>) -> Self {
        self.resource_owner = Some(owner.into());
        self
    }

    /// Adds a clause; clauses are OR'd.
    pub fn filter(mut self, filter: AggregateFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn sequence_greater(mut self, sequence: u64) -> Self {
        self.sequence_greater = Some(sequence);
        self
    }

    pub fn sequence_less(mut self, sequence: u64) -> Self {
        self.sequence_less = Some(sequence);
        self
    }

    /// Only events of pushes after `position`.
    pub fn position_after(mut self, position: Position) -> Self {
        self.position_after = Some((position, None));
        self
    }

    /// Resumes after a specific event: later positions, or the same
    /// position with a higher `in_tx_order`.
    pub fn resume_after(mut self, position: Position, in_tx_order: u32) -> Self {
        self.position_after = Some((position, Some(in_tx_order)));
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    /// Skips aggregates that have any event of `event_types`.
    pub fn exclude_aggregates_with<A, E, S, T>(mut self, aggregate_types: A, event_types: E) -> Self
    where
        A: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        self.exclusion = Some(Exclusion {
            aggregate_types: aggregate_types.into_iter().map(Into::into).collect(),
            event_types: event_types.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Bounds the read by the log's high-water mark taken at its start, so
    /// the result is exactly the set of pushes committed before the read.
    pub fn await_open_transactions(mut self) -> Self {
        self.await_open_transactions = true;
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn awaits_open_transactions(&self) -> bool {
        self.await_open_transactions
    }

    /// Rejects queries that would scan the whole log or cross tenants.
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(Error::precondition_failed("query requires an instance"));
        }
        self.validate_clauses()
    }

    fn validate_clauses(&self) -> Result<()> {
        if self.filters.is_empty() {
            return Err(Error::precondition_failed(
                "query requires at least one aggregate filter",
            ));
        }
        if self.filters.iter().any(|f| f.aggregate_types.is_empty()) {
            return Err(Error::precondition_failed(
                "every aggregate filter requires an aggregate type",
            ));
        }
        if let Some(exclusion) = &self.exclusion {
            if exclusion.aggregate_types.is_empty() || exclusion.event_types.is_empty() {
                return Err(Error::precondition_failed(
                    "exclusion requires aggregate types and event types",
                ));
            }
        }
        Ok(())
    }

    /// Renders the statement. `watermark` is the high-water mark read at
    /// the start of an open-transaction-aware read.
    pub(crate) fn to_sql(
        &self,
        projection: Projection,
        watermark: Option<Position>,
    ) -> Result<(String, Vec<Value>)> {
        match projection {
            Projection::InstanceIds if self.all_instances => self.validate_clauses()?,
            _ => self.validate()?,
        }

        let mut params = Vec::new();
        let mut sql = match projection {
            Projection::Events => format!("SELECT {EVENT_COLUMNS} FROM events WHERE "),
            Projection::MaxPosition => "SELECT MAX(position) FROM events WHERE ".to_string(),
            Projection::InstanceIds => "SELECT DISTINCT instance_id FROM events WHERE ".to_string(),
        };

        if !self.all_instances {
            params.push(Value::Text(self.instance_id.as_str().to_string()));
            sql.push_str(&format!("instance_id = ?{} AND ", params.len()));
        }

        sql.push('(');
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            filter.push_sql(&mut sql, &mut params);
        }
        sql.push(')');

        if let Some(owner) = &self.resource_owner {
            params.push(Value::Text(owner.clone()));
            sql.push_str(&format!(" AND owner = ?{}", params.len()));
        }
        if let Some(creator) = &self.creator {
            params.push(Value::Text(creator.clone()));
            sql.push_str(&format!(" AND creator = ?{}", params.len()));
        }
        if let Some(sequence) = self.sequence_greater {
            params.push(Value::Integer(to_i64(sequence)));
            sql.push_str(&format!(" AND sequence > ?{}", params.len()));
        }
        if let Some(sequence) = self.sequence_less {
            params.push(Value::Integer(to_i64(sequence)));
            sql.push_str(&format!(" AND sequence < ?{}", params.len()));
        }
        match self.position_after {
            Some((position, None)) => {
                params.push(Value::Integer(position.to_micros()));
                sql.push_str(&format!(" AND position > ?{}", params.len()));
            }
            Some((position, Some(in_tx_order))) => {
                params.push(Value::Integer(position.to_micros()));
                let p = params.len();
                params.push(Value::Integer(i64::from(in_tx_order)));
                let o = params.len();
                sql.push_str(&format!(
                    " AND (position > ?{p} OR (position = ?{p} AND in_tx_order > ?{o}))"
                ));
            }
            None => {}
        }
        if let Some(at) = self.created_after {
            params.push(Value::Text(format_timestamp(at)));
            sql.push_str(&format!(" AND created_at > ?{}", params.len()));
        }
        match &self.exclusion {
            Some(exclusion) if self.all_instances => {
                let types = in_list("aggregate_type", &exclusion.aggregate_types, &mut params);
                let events = in_list("event_type", &exclusion.event_types, &mut params);
                sql.push_str(&format!(
                    " AND (instance_id, aggregate_id) NOT IN (
                        SELECT instance_id, aggregate_id FROM events
                        WHERE {types} AND {events})"
                ));
            }
            Some(exclusion) => {
                params.push(Value::Text(self.instance_id.as_str().to_string()));
                let inst = params.len();
                let types = in_list("aggregate_type", &exclusion.aggregate_types, &mut params);
                let events = in_list("event_type", &exclusion.event_types, &mut params);
                sql.push_str(&format!(
                    " AND aggregate_id NOT IN (
                        SELECT aggregate_id FROM events
                        WHERE instance_id = ?{inst} AND {types} AND {events})"
                ));
            }
            None => {}
        }
        if let Some(watermark) = watermark {
            params.push(Value::Integer(watermark.to_micros()));
            sql.push_str(&format!(" AND position <= ?{}", params.len()));
        }

        if projection == Projection::InstanceIds {
            sql.push_str(" ORDER BY instance_id");
        }
        if projection == Projection::Events {
            if self.descending {
                sql.push_str(" ORDER BY position DESC, in_tx_order DESC");
            } else {
                sql.push_str(" ORDER BY position ASC, in_tx_order ASC");
            }
            if let Some(limit) = self.limit {
                params.push(Value::Integer(to_i64(limit)));
                sql.push_str(&format!(" LIMIT ?{}", params.len()));
            }
        }

        Ok((sql, params))
    }
}

fn in_list(column: &str, values: &[String], params: &mut Vec<Value>) -> String {
    if let [single] = values {
        params.push(Value::Text(single.clone()));
        return format!("{column} = ?{}", params.len());
    }
    let placeholders: Vec<String> = values
        .iter()
        .map(|v| {
            params.push(Value::Text(v.clone()));
            format!("?{}", params.len())
        })
        .collect();
    format!("{column} IN ({})", placeholders.join(", "))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) const EVENT_COLUMNS: &str = "instance_id, owner, aggregate_type, aggregate_id, \
     event_type, sequence, position, in_tx_order, created_at, creator, revision, payload";

/// Maps a row selected with [`EVENT_COLUMNS`].
pub(crate) fn read_event(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
    let created_at: String = row.get(8)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| conversion_failure(8, e))?
        .with_timezone(&Utc);
    let payload: Option<String> = row.get(11)?;
    let payload = payload
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| conversion_failure(11, e))?;
    Ok(StoredEvent {
        aggregate: Aggregate {
            instance_id: InstanceId::new(row.get::<_, String>(0)?),
            resource_owner: row.get(1)?,
            aggregate_type: row.get(2)?,
            id: row.get(3)?,
        },
        event_type: row.get(4)?,
        sequence: row.get(5)?,
        position: Position::from_micros(row.get(6)?),
        in_tx_order: row.get(7)?,
        created_at,
        creator: row.get(9)?,
        revision: row.get(10)?,
        payload,
    })
}

fn conversion_failure<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}
