//! Error mapping for the event store.
//!
//! Storage failures are classified into the shared [`warden_types::ErrorKind`] taxonomy:
//! SQLite busy/locked conditions are transient (`Unavailable`), everything
//! else the database reports is `Internal`.

use warden_types::Error;

/// Errors raised while turning a stored event into a typed domain event.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// No decoder is registered for the aggregate/event type pair.
    #[error("no decoder registered for {aggregate_type}/{event_type}")]
    Unregistered {
        /// Aggregate type of the event.
        aggregate_type: String,
        /// Event type of the event.
        event_type: String,
    },

    /// The event type is not part of the family's vocabulary.
    #[error("event type {0} is unknown to this aggregate")]
    UnknownEventType(String),

    /// The event type requires a payload but none was stored.
    #[error("event {0} carries no payload")]
    MissingPayload(String),

    /// The payload does not match the declared shape.
    #[error("payload of {event_type} does not match its shape: {source}")]
    Payload {
        /// Event type whose payload failed to parse.
        event_type: String,
        /// The underlying JSON error.
        source: serde_json::Error,
    },
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::internal("event could not be decoded").with_source(err)
    }
}

/// Maps a SQLite error onto the shared taxonomy.
pub(crate) fn storage_error(err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
            Error::unavailable("storage is busy").with_source(err)
        }
        _ => Error::internal("storage failure").with_source(err),
    }
}

/// Maps a connection-pool checkout failure. The pool only fails when no
/// connection became free before its timeout, which is transient.
pub(crate) fn pool_error(err: r2d2::Error) -> Error {
    Error::unavailable("no database connection available").with_source(err)
}

pub(crate) fn join_error(err: tokio::task::JoinError) -> Error {
    Error::internal("storage task failed").with_source(err)
}

/// Whether the error is a SQLite constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}
