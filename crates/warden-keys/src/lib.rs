//! Signing-key maintenance for Warden instances.
//!
//! [`KeyMaintainer::ensure_key`] returns an active key pair of a usage and
//! generates one when none exists. Generation is guarded by the store's
//! exclusive-task lock so concurrent processes produce a single key.
//! Private keys are sealed with [`KeySealer`] before they are recorded.

mod generate;
mod maintainer;
mod seal;

pub use generate::{fingerprint, generate_key_pair, ALGORITHM};
pub use maintainer::{KeyMaintainer, KeySettings};
pub use seal::{KeySealer, SealError, CIPHER};
