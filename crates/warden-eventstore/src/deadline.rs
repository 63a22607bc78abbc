//! Caller-supplied operation deadlines.

use std::time::{Duration, Instant};

use warden_types::{Error, Result};

/// Point in time after which an operation must give up.
///
/// Checked at the suspension points of an operation. A push checks it once
/// more right before commit, so an expired deadline rolls the whole
/// transaction back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub const NONE: Deadline = Deadline(None);

    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Self {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Self(Some(a.min(b))),
            (a, b) => Self(a.or(b)),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// # Errors
    ///
    /// `DeadlineExceeded` once the deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::deadline_exceeded("operation deadline exceeded"));
        }
        Ok(())
    }
}
