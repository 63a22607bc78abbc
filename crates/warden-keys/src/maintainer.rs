//! Making sure every instance has a valid key of each usage.
//!
//! Several processes may start at once against the same store. Each one
//! reads the active keys; only the holder of the per-usage lock generates.
//! Everyone else backs off and reads again until the new key is visible.

use std::time::Duration;

use warden_domain::keypair::{self, ActiveKey, ActiveKeysWriteModel, KeyUsage};
use warden_domain::{Actor, Commands};
use warden_eventstore::{Clock, Deadline, Locker, RetryPolicy};
use warden_types::{Error, ErrorKind, InstanceId, Result, SYSTEM_USER};

use crate::generate::generate_key_pair;
use crate::seal::KeySealer;

/// Tuning of key maintenance.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySettings {
    /// How long a generator holds the lock.
    pub lock_duration: Duration,
    /// Read–lock–generate attempts and the pause between them.
    pub retry: RetryPolicy,
    pub key_lifetime: chrono::Duration,
    /// A key expiring within this period no longer counts as active.
    pub grace_period: chrono::Duration,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            key_lifetime: chrono::Duration::days(365),
            grace_period: chrono::Duration::hours(1),
        }
    }
}

/// Generates missing keys, at most one process at a time per instance and
/// usage.
#[derive(Debug, Clone)]
pub struct KeyMaintainer {
    commands: Commands,
    locker: Locker,
    sealer: KeySealer,
    settings: KeySettings,
}

impl KeyMaintainer {
    /// Each maintainer locks under its own locker id.
    pub fn new(commands: Commands, sealer: KeySealer, settings: KeySettings) -> Self {
        let locker = commands.store().locker();
        Self {
            commands,
            locker,
            sealer,
            settings,
        }
    }

    pub fn sealer(&self) -> &KeySealer {
        &self.sealer
    }

    /// Returns an active key of `usage`, generating one if none exists.
    ///
    /// # Errors
    ///
    /// The last attempt's error once the retry policy is used up; notably
    /// `Unavailable` when another process held the lock throughout.
    #[tracing::instrument(skip(self, instance_id, usage), fields(%instance_id, %usage))]
    pub async fn ensure_key(&self, instance_id: &InstanceId, usage: KeyUsage) -> Result<ActiveKey> {
        let clock = self.commands.store().clock();
        self.settings
            .retry
            .run_while(clock.as_ref(), |_| true, |attempt| {
                self.attempt(instance_id, usage, attempt)
            })
            .await
    }

    async fn attempt(&self, instance_id: &InstanceId, usage: KeyUsage, attempt: u32) -> Result<ActiveKey> {
        if let Some(key) = self.active_key(instance_id, usage).await? {
            return Ok(key);
        }

        let object = format!("{}:{}", keypair::AGGREGATE_TYPE, usage);
        let mut acquired = self
            .locker
            .lock(instance_id, &object, self.settings.lock_duration, Deadline::NONE);
        match acquired.recv().await {
            Some(Ok(())) => {}
            Some(Err(err)) if err.is(ErrorKind::AlreadyExists) => {
                tracing::debug!(attempt, "another process is generating the key");
                return Err(Error::unavailable("key generation in progress elsewhere"));
            }
            Some(Err(err)) => return Err(err),
            None => return Err(Error::internal("lock result channel closed")),
        }

        // A previous holder may have finished between the read and the lock.
        if let Some(key) = self.active_key(instance_id, usage).await? {
            return Ok(key);
        }

        let now = self.commands.store().clock().now();
        let key = generate_key_pair(usage, now, self.settings.key_lifetime, &self.sealer)?;
        let key_id = uuid::Uuid::new_v4().to_string();
        let actor = Actor::new(instance_id.clone(), SYSTEM_USER);
        self.commands.add_key_pair(&actor, &key_id, key.clone()).await?;
        tracing::info!(%key_id, fingerprint = %key.fingerprint, "generated key pair");
        Ok(ActiveKey { key_id, key })
    }

    async fn active_key(&self, instance_id: &InstanceId, usage: KeyUsage) -> Result<Option<ActiveKey>> {
        let valid_at = self.commands.store().clock().now() + self.settings.grace_period;
        let loaded = self
            .commands
            .store()
            .load(
                ActiveKeysWriteModel::new(instance_id.clone(), usage, valid_at),
                Deadline::NONE,
            )
            .await?;
        Ok(loaded.model.newest().cloned())
    }
}
