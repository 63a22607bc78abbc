//! Domain vocabulary of the Warden IAM platform.
//!
//! Each module defines one aggregate type: its event family (payloads,
//! unique constraints, search fields) and the write models that reduce it.
//! [`registry`] wires every family into one [`EventRegistry`] over
//! [`DomainEvent`]; [`Commands`] validates intents against write models and
//! pushes them.
//!
//! | Module | Aggregate |
//! |---|---|
//! | [`user`] | human users, usernames unique per instance |
//! | [`org`] | organizations and their members |
//! | [`project`] | projects, names unique per organization, members |
//! | [`saml`] | SAML apps, entity IDs unique across instances |
//! | [`keypair`] | signing key pairs per instance |

pub mod commands;
pub mod keypair;
pub mod member;
pub mod org;
pub mod project;
pub mod saml;
pub mod user;

pub use commands::{Actor, Commands, ObjectDetails};

use warden_eventstore::{EventRegistry, RegistryBuilder};

/// Every event the platform understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    User(user::UserEvent),
    Org(org::OrgEvent),
    Project(project::ProjectEvent),
    SamlApp(saml::SamlAppEvent),
    KeyPair(keypair::KeyPairEvent),
}

/// Adds every domain family to `builder`.
pub fn register(builder: &mut RegistryBuilder<DomainEvent>) {
    builder
        .register_family(DomainEvent::User)
        .register_family(DomainEvent::Org)
        .register_family(DomainEvent::Project)
        .register_family(DomainEvent::SamlApp)
        .register_family(DomainEvent::KeyPair);
}

/// The registry of all domain families.
pub fn registry() -> EventRegistry<DomainEvent> {
    let mut builder = RegistryBuilder::new();
    register(&mut builder);
    builder.build()
}

#[cfg(test)]
mod tests;
