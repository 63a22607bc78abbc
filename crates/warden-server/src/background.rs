//! Background tasks for the Warden daemon.
//!
//! Includes:
//! - Signing-key maintenance for configured or discovered instances.

use tokio::time::{sleep, Duration};
use warden_domain::keypair::KeyUsage;
use warden_domain::{org, DomainEvent};
use warden_eventstore::Eventstore;
use warden_keys::KeyMaintainer;
use warden_types::{InstanceId, Result};

/// Where a maintenance round takes its instances from.
#[derive(Debug, Clone)]
pub enum InstanceSource {
    /// A fixed list from configuration.
    Configured(Vec<InstanceId>),
    /// Every instance holding an organization, read from the log each round.
    Discovered(Eventstore<DomainEvent>),
}

impl InstanceSource {
    /// The instances of the current round.
    ///
    /// # Errors
    ///
    /// Returns the store error when discovery cannot read the log.
    pub async fn resolve(&self) -> Result<Vec<InstanceId>> {
        match self {
            Self::Configured(instances) => Ok(instances.clone()),
            Self::Discovered(store) => store.instance_ids(org::instances_with_orgs()).await,
        }
    }
}

/// Ensures every instance holds an active key of every usage.
///
/// Failures are logged per `(instance, usage)` and do not stop the round.
/// Returns the number of failures.
pub async fn run_key_maintenance(
    maintainer: &KeyMaintainer,
    instances: &[InstanceId],
    usages: &[KeyUsage],
) -> usize {
    let mut failures = 0;
    for instance_id in instances {
        for &usage in usages {
            match maintainer.ensure_key(instance_id, usage).await {
                Ok(key) => {
                    tracing::debug!(%instance_id, %usage, key_id = %key.key_id, "key active");
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(%instance_id, %usage, kind = %e.kind(), error = %e, "key maintenance failed");
                }
            }
        }
    }
    failures
}

/// Starts the key maintenance task.
///
/// Runs one round immediately, then one every `interval`. A zero interval
/// runs the startup round only.
pub async fn start_key_maintenance_task(
    maintainer: KeyMaintainer,
    source: InstanceSource,
    usages: Vec<KeyUsage>,
    interval: Duration,
) {
    tracing::info!(
        discovered = matches!(source, InstanceSource::Discovered(_)),
        usages = usages.len(),
        interval_seconds = interval.as_secs(),
        "starting key maintenance task"
    );

    loop {
        match source.resolve().await {
            Ok(instances) => {
                let failures = run_key_maintenance(&maintainer, &instances, &usages).await;
                if failures > 0 {
                    tracing::warn!(
                        failures,
                        instances = instances.len(),
                        "key maintenance round finished with failures"
                    );
                }
            }
            Err(e) => {
                tracing::error!(kind = %e.kind(), error = %e, "could not list instances for key maintenance");
            }
        }
        if interval.is_zero() {
            tracing::info!("key maintenance interval is zero, not rescheduling");
            return;
        }
        sleep(interval).await;
    }
}
