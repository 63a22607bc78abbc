//! Event-sourced aggregate store for the Warden identity platform.
//!
//! Every domain object (user, organization, project, key pair, ...) is a
//! typed event vocabulary on top of this crate. The store guarantees:
//!
//! - no lost updates: per-aggregate sequences with optimistic expectations,
//! - no duplicate unique values: the constraint ledger commits with the
//!   events or not at all,
//! - tenant isolation: every read and write is scoped to one instance,
//! - deterministic replay: write models are pure folds over ordered events.
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | `event` | aggregates, stored events, commands, [`EventFamily`] |
//! | `registry` | `(aggregate type, event type)` → decoder table |
//! | `unique` | unique-constraint directives and ledger |
//! | `fields` | best-effort search-field index |
//! | `query` | [`SearchQuery`] filter builder |
//! | `push` | the atomic append pipeline |
//! | `write_model` | [`WriteModel`] and [`reduce`] |
//! | `lock` | [`Locker`], the exclusive-task lock |
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = Eventstore::new(pool, registry);
//! let user = Aggregate::new("inst-1", "org-1", "user", "u1");
//! let events = store
//!     .push(
//!         PushIntent::new("inst-1")
//!             .command(Command::from_event(user.clone(), "admin", &added)?)
//!             .expect(&user, Expected::NEW),
//!     )
//!     .await?;
//! ```

mod deadline;
mod error;
mod event;
mod fields;
mod lock;
mod push;
mod query;
mod registry;
mod retry;
mod store;
mod unique;
mod write_model;

pub use deadline::Deadline;
pub use error::DecodeError;
pub use event::{Aggregate, AggregateKey, Command, EventFamily, Position, StoredEvent};
pub use fields::{FieldOperation, SearchField, SearchObject, SearchValue};
pub use lock::Locker;
pub use push::{Expected, PushIntent};
pub use query::{AggregateFilter, SearchQuery};
pub use registry::{EventRegistry, RegistryBuilder};
pub use retry::{Clock, ManualClock, RetryPolicy, SystemClock};
pub use store::{EventStream, Eventstore, EventstoreConfig};
pub use unique::{UniqueAction, UniqueConstraint};
pub use write_model::{reduce, Reduced, WriteModel};
