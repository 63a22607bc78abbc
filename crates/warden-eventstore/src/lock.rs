//! Distributed exclusive-task lock.
//!
//! Rows in `locks` are keyed by `(instance, resource owner)`. Acquisition is
//! one conditional upsert: it succeeds when no row exists, the row has
//! expired, or the caller already holds it. There is no release; holders
//! finish well within the duration and treat expiry as possible loss of
//! exclusivity.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tokio::sync::mpsc;
use warden_db::DbPool;
use warden_types::{Error, InstanceId, Result};

use crate::deadline::Deadline;
use crate::error::{join_error, pool_error, storage_error};
use crate::retry::Clock;

/// Lock handle owned by one process. Every handle gets its own locker id.
#[derive(Clone)]
pub struct Locker {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    locker_id: String,
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("locker_id", &self.locker_id)
            .finish()
    }
}

impl Locker {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self::with_id(pool, clock, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(pool: DbPool, clock: Arc<dyn Clock>, locker_id: impl Into<String>) -> Self {
        Self {
            pool,
            clock,
            locker_id: locker_id.into(),
        }
    }

    pub fn locker_id(&self) -> &str {
        &self.locker_id
    }

    /// Tries to take the lock for `duration`.
    ///
    /// The receiver yields exactly one result and then closes: `Ok(())`
    /// when the lock is held, `AlreadyExists` when another locker holds it,
    /// or the storage error.
    pub fn lock(
        &self,
        instance_id: &InstanceId,
        resource_owner: &str,
        duration: Duration,
        deadline: Deadline,
    ) -> mpsc::Receiver<Result<()>> {
        let (tx, rx) = mpsc::channel(1);
        let this = self.clone();
        let instance_id = instance_id.clone();
        let resource_owner = resource_owner.to_string();
        tokio::spawn(async move {
            let result = this
                .try_lock(instance_id, resource_owner, duration, deadline)
                .await;
            // The caller may have dropped the receiver; nothing to report then.
            let _ = tx.send(result).await;
        });
        rx
    }

    #[tracing::instrument(skip(self, deadline), fields(locker_id = %self.locker_id))]
    async fn try_lock(
        &self,
        instance_id: InstanceId,
        resource_owner: String,
        duration: Duration,
        deadline: Deadline,
    ) -> Result<()> {
        deadline.check()?;
        let now = self.clock.now();
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| Error::invalid_argument("lock duration out of range"))?;
        let (now, until) = (now.timestamp_micros(), until.timestamp_micros());
        let pool = self.pool.clone();
        let locker_id = self.locker_id.clone();
        let owner = resource_owner.clone();
        let instance = instance_id.clone();

        let acquired = tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = pool.get().map_err(pool_error)?;
            let changed = conn
                .execute(
                    "INSERT INTO locks (instance_id, resource_owner, locker_id, locked_until)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (instance_id, resource_owner) DO UPDATE SET
                        locker_id = excluded.locker_id,
                        locked_until = excluded.locked_until
                     WHERE locks.locked_until <= ?5 OR locks.locker_id = excluded.locker_id",
                    params![instance.as_str(), owner, locker_id, until, now],
                )
                .map_err(storage_error)?;
            Ok(changed == 1)
        })
        .await
        .map_err(join_error)??;

        if acquired {
            tracing::debug!(%instance_id, %resource_owner, ?duration, "lock acquired");
            Ok(())
        } else {
            tracing::debug!(%instance_id, %resource_owner, "lock held by another locker");
            Err(Error::already_exists(format!(
                "lock for {resource_owner} in instance {instance_id} is held"
            )))
        }
    }
}
