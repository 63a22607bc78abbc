//! The async event store.
//!
//! Every operation checks out a pooled connection on the blocking thread
//! pool. Pushes run in one `IMMEDIATE` transaction (see [`crate::push`]);
//! reads run as single statements, which in WAL mode see one consistent
//! snapshot.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use rusqlite::types::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use warden_db::DbPool;
use warden_types::{Error, InstanceId, Result};

use crate::deadline::Deadline;
use crate::error::{join_error, pool_error, storage_error};
use crate::event::{Aggregate, Position, StoredEvent};
use crate::fields::{self, SearchField};
use crate::lock::Locker;
use crate::push::{push_blocking, PushIntent};
use crate::query::{read_event, Projection, SearchQuery};
use crate::registry::EventRegistry;
use crate::retry::{Clock, RetryPolicy, SystemClock};
use crate::write_model::{reduce, Reduced, WriteModel};

/// Stream of events produced by [`Eventstore::filter`].
pub type EventStream = ReceiverStream<Result<StoredEvent>>;

/// Tunables of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventstoreConfig {
    /// Retry policy for transient storage failures during push. Conflict
    /// and AlreadyExists are never retried.
    pub push_retry: RetryPolicy,
    /// Deadline applied when the caller passes none.
    pub default_timeout: Option<Duration>,
    /// Events buffered between the database reader and a filter consumer.
    pub stream_buffer: usize,
}

impl Default for EventstoreConfig {
    fn default() -> Self {
        Self {
            push_retry: RetryPolicy::new(3, Duration::from_millis(50)),
            default_timeout: Some(Duration::from_secs(30)),
            stream_buffer: 256,
        }
    }
}

struct Inner<E> {
    pool: DbPool,
    registry: EventRegistry<E>,
    clock: Arc<dyn Clock>,
    config: EventstoreConfig,
}

/// Handle to the event store. Cheap to clone.
pub struct Eventstore<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for Eventstore<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for Eventstore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eventstore")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<E: Send + 'static> Eventstore<E> {
    pub fn new(pool: DbPool, registry: EventRegistry<E>) -> Self {
        Self::with_clock(pool, registry, Arc::new(SystemClock), EventstoreConfig::default())
    }

    pub fn with_clock(
        pool: DbPool,
        registry: EventRegistry<E>,
        clock: Arc<dyn Clock>,
        config: EventstoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                registry,
                clock,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &EventRegistry<E> {
        &self.inner.registry
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// A lock handle on the same database and clock.
    pub fn locker(&self) -> Locker {
        Locker::new(self.inner.pool.clone(), self.clock())
    }

    fn effective(&self, deadline: Deadline) -> Deadline {
        match self.inner.config.default_timeout {
            Some(timeout) => deadline.min(Deadline::after(timeout)),
            None => deadline,
        }
    }

    /// Appends the intent's commands atomically.
    ///
    /// Returns the persisted events with their final sequence, position and
    /// pinned resource owner. An empty intent returns no events.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for malformed commands or payloads, `Conflict` for a
    /// stale expectation, `AlreadyExists` for a unique collision,
    /// `Unavailable` once transient failures exhaust the retry policy,
    /// `DeadlineExceeded`, or `Internal`.
    #[tracing::instrument(skip(self, intent), fields(instance_id = %intent.instance_id(), events = intent.len()))]
    pub async fn push(&self, intent: PushIntent) -> Result<Vec<StoredEvent>> {
        if intent.is_empty() {
            return Ok(Vec::new());
        }
        intent.validate(&self.inner.registry)?;
        let deadline = self.effective(intent.current_deadline());
        let intent = Arc::new(intent.deadline(deadline));

        let result = self
            .inner
            .config
            .push_retry
            .run(self.inner.clock.as_ref(), |attempt| {
                let inner = Arc::clone(&self.inner);
                let intent = Arc::clone(&intent);
                async move {
                    deadline.check()?;
                    if attempt > 1 {
                        tracing::debug!(attempt, "retrying push");
                    }
                    tokio::task::spawn_blocking(move || {
                        let mut conn = inner.pool.get().map_err(pool_error)?;
                        push_blocking(&mut conn, inner.clock.as_ref(), &intent)
                    })
                    .await
                    .map_err(join_error)?
                }
            })
            .await;

        if let Err(err) = &result {
            tracing::debug!(kind = %err.kind(), error = %err, "push rejected");
        }
        result
    }

    /// Streams the events matching `query` in its order.
    ///
    /// The stream is lazy and back-pressured by the configured buffer.
    /// Validation errors are returned before any I/O; storage errors during
    /// the read end the stream with one `Err` item.
    ///
    /// The reader holds a pooled connection until the stream is drained or
    /// dropped. Streams left open count against the pool size, so enough of
    /// them make pushes wait for a connection and fail with `Unavailable`.
    #[tracing::instrument(skip(self, query, deadline), fields(instance_id = %query.instance_id()))]
    pub fn filter(&self, query: SearchQuery, deadline: Deadline) -> Result<EventStream> {
        query.validate()?;
        let deadline = self.effective(deadline);
        let (tx, rx) = mpsc::channel(self.inner.config.stream_buffer.max(1));
        let pool = self.inner.pool.clone();

        tokio::task::spawn_blocking(move || {
            if let Err(err) = stream_events(&pool, &query, deadline, &tx) {
                let _ = tx.blocking_send(Err(err));
            }
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Collects [`filter`](Self::filter) into a vector.
    pub async fn query(&self, query: SearchQuery, deadline: Deadline) -> Result<Vec<StoredEvent>> {
        let mut stream = self.filter(query, deadline)?;
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event?);
        }
        Ok(events)
    }

    /// Highest position among the events matching `query`, or zero.
    pub async fn latest_position(&self, query: SearchQuery) -> Result<Position> {
        let (sql, values) = query.to_sql(Projection::MaxPosition, None)?;
        self.blocking(move |conn| {
            let max: Option<i64> = conn
                .query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))
                .map_err(storage_error)?;
            Ok(max.map_or(Position::ZERO, Position::from_micros))
        })
        .await
    }

    /// Instances having events that match `query`, in id order.
    ///
    /// The query may come from [`SearchQuery::across_instances`].
    pub async fn instance_ids(&self, query: SearchQuery) -> Result<Vec<InstanceId>> {
        let (sql, values) = query.to_sql(Projection::InstanceIds, None)?;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(storage_error)?;
            let ids = stmt
                .query_map(rusqlite::params_from_iter(values), |row| row.get::<_, String>(0))
                .map_err(storage_error)?
                .map(|id| id.map(InstanceId::new).map_err(storage_error))
                .collect::<Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }

    /// Latest sequence of an aggregate, 0 if it has no events.
    pub async fn latest_sequence(&self, aggregate: &Aggregate) -> Result<u64> {
        let key = aggregate.key();
        self.blocking(move |conn| {
            let max: Option<u64> = conn
                .query_row(
                    "SELECT MAX(sequence) FROM events
                     WHERE instance_id = ?1 AND aggregate_type = ?2 AND aggregate_id = ?3",
                    params![key.instance_id.as_str(), key.aggregate_type, key.aggregate_id],
                    |row| row.get(0),
                )
                .map_err(storage_error)?;
            Ok(max.unwrap_or(0))
        })
        .await
    }

    /// Reads the model's events and reduces them into `initial`.
    pub async fn load<M>(&self, initial: M, deadline: Deadline) -> Result<Reduced<M>>
    where
        M: WriteModel<E>,
    {
        let events = self.query(initial.query(), deadline).await?;
        reduce(&self.inner.registry, initial, &events)
    }

    /// Looks up indexed search fields by value.
    pub async fn search_fields(
        &self,
        instance_id: &InstanceId,
        object_type: &str,
        field_name: &str,
        value: serde_json::Value,
    ) -> Result<Vec<SearchField>> {
        let instance_id = instance_id.clone();
        let object_type = object_type.to_string();
        let field_name = field_name.to_string();
        self.blocking(move |conn| fields::search(conn, &instance_id, &object_type, &field_name, &value))
            .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.inner.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(pool_error)?;
            f(&conn)
        })
        .await
        .map_err(join_error)?
    }
}

/// Feeds the rows of `query` into `tx` until done, the deadline passes or
/// the consumer goes away.
fn stream_events(
    pool: &DbPool,
    query: &SearchQuery,
    deadline: Deadline,
    tx: &mpsc::Sender<Result<StoredEvent>>,
) -> Result<()> {
    let conn = pool.get().map_err(pool_error)?;
    let watermark = if query.awaits_open_transactions() {
        let max: Option<i64> = conn
            .query_row("SELECT MAX(position) FROM events", [], |row| row.get(0))
            .map_err(storage_error)?;
        Some(max.map_or(Position::ZERO, Position::from_micros))
    } else {
        None
    };
    let (sql, values): (String, Vec<Value>) = query.to_sql(Projection::Events, watermark)?;

    let mut stmt = conn.prepare(&sql).map_err(storage_error)?;
    let mut rows = stmt
        .query(rusqlite::params_from_iter(values))
        .map_err(storage_error)?;
    while let Some(row) = rows.next().map_err(storage_error)? {
        deadline.check()?;
        let event = read_event(row).map_err(|e| {
            Error::internal("stored event could not be read").with_source(e)
        })?;
        if tx.blocking_send(Ok(event)).is_err() {
            tracing::trace!("filter consumer dropped");
            return Ok(());
        }
    }
    Ok(())
}
