//! Error taxonomy shared by every Warden crate.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// A specialized `Result` type for Warden operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed underlying cause of an [`Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The kind of a failure, independent of where it was raised.
///
/// Command handlers branch on the kind: `Conflict` means "reload the write
/// model and try again", `AlreadyExists` is terminal, `Internal` and
/// `Unavailable` are logged and optionally retried with backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed command or payload.
    InvalidArgument,
    /// A unique constraint or exclusive lock is already held.
    AlreadyExists,
    /// Aggregate or resource absent.
    NotFound,
    /// A business-rule precondition does not hold.
    PreconditionFailed,
    /// Optimistic-concurrency loss: another writer appended first.
    Conflict,
    /// Unexpected fault.
    Internal,
    /// Caller identity could not be established.
    Unauthenticated,
    /// Caller is not allowed to perform the operation.
    PermissionDenied,
    /// Transient storage failure.
    Unavailable,
    /// The caller's deadline passed before the operation finished.
    DeadlineExceeded,
}

impl ErrorKind {
    /// Returns the canonical label for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::NotFound => "NOT_FOUND",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::Conflict => "CONFLICT",
            Self::Internal => "INTERNAL",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Unavailable => "UNAVAILABLE",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
        }
    }

    /// Whether a caller may retry the operation unchanged (after reloading
    /// state, in the case of `Conflict`).
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Conflict | Self::Unavailable)
    }

    /// Whether the kind may be shown to an end user as-is.
    ///
    /// Transient and internal kinds are translated to a generic internal
    /// error before they reach an API boundary.
    pub const fn is_user_visible(self) -> bool {
        matches!(
            self,
            Self::InvalidArgument
                | Self::AlreadyExists
                | Self::NotFound
                | Self::PreconditionFailed
                | Self::Unauthenticated
                | Self::PermissionDenied
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by the store or a layer built on it.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: Cow<'static, str>,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the underlying cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn already_exists(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn precondition_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, message)
    }

    pub fn conflict(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn permission_denied(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn unauthenticated(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The message attached when the error was raised.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Converts the error into the form an end user may see.
    ///
    /// User-visible kinds keep their message. Everything else becomes a
    /// generic `Internal` error, and the original is logged.
    pub fn to_user_facing(self) -> Self {
        if self.kind.is_user_visible() {
            return self;
        }
        tracing::error!(kind = %self.kind, error = %self, "internal error hidden from caller");
        Self::internal("internal error")
    }
}
