//! Warden daemon library logic: startup wiring and background tasks.

pub mod background;
pub mod config;

use config::Config;
use thiserror::Error;
use warden_db::{DbPool, MigrationError, PoolError};
use warden_domain::{Commands, DomainEvent};
use warden_eventstore::{Eventstore, SystemClock};
use warden_keys::{KeyMaintainer, KeySealer, SealError};

use std::sync::Arc;

/// Everything the daemon runs on, built once at startup.
#[derive(Debug, Clone)]
pub struct Services {
    pub pool: DbPool,
    pub store: Eventstore<DomainEvent>,
    pub commands: Commands,
    /// Present when key maintenance is enabled.
    pub key_maintainer: Option<KeyMaintainer>,
}

/// Errors that stop the daemon from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to get database connection for migrations: {0}")]
    Connection(#[from] r2d2::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("invalid keys.encryption_key: {0}")]
    Sealer(#[from] SealError),
}

/// Opens the database, applies migrations and builds the store.
///
/// # Errors
///
/// Returns `StartupError` if the pool, a migration or the key sealer
/// cannot be set up.
pub fn start(config: &Config) -> Result<Services, StartupError> {
    let pool = warden_db::create_pool(&config.database.path, config.database.runtime_settings())?;
    {
        let conn = pool.get()?;
        let applied = warden_db::run_migrations(&conn)?;
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let registry = warden_domain::registry();
    tracing::info!(event_types = registry.len(), "event registry ready");
    let store = Eventstore::with_clock(
        pool.clone(),
        registry,
        Arc::new(SystemClock),
        config.eventstore.store_config(),
    );
    let commands = Commands::new(store.clone());

    let key_maintainer = match (config.keys.enabled, config.keys.encryption_key.as_deref()) {
        (true, Some(key)) => Some(KeyMaintainer::new(
            commands.clone(),
            KeySealer::from_hex(key)?,
            config.keys.settings(),
        )),
        _ => None,
    };

    Ok(Services {
        pool,
        store,
        commands,
        key_maintainer,
    })
}
