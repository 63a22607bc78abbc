//! Shared types and error definitions for the Warden platform.
//!
//! This crate provides the foundational types used across all Warden crates:
//! the error taxonomy every store operation reports through, and the
//! tenancy identifiers that scope aggregates.
//!
//! No crate in the workspace depends on anything *except* `warden-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

mod error;

pub use error::{BoxError, Error, ErrorKind, Result};

use serde::{Deserialize, Serialize};

/// Identifier of the system user recorded as editor for events the platform
/// emits on its own behalf (background key generation, migrations).
pub const SYSTEM_USER: &str = "SYSTEM";

/// Tenant boundary: every event, unique row and lock belongs to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (never valid for a push or query).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_serializes_transparently() {
        let id = InstanceId::new("inst-1");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"inst-1\"");
        let back: InstanceId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn empty_instance_is_detected() {
        assert!(InstanceId::new("").is_empty());
        assert!(!InstanceId::from("a").is_empty());
    }
}
