//! Cancellable polling and the cluster status poller
//!
//! [`poll_until`] is the generic primitive: it sleeps for a fixed interval,
//! runs a check and stops when the check yields a value, fails, or the
//! cancellation token fires. [`StatusPoller`] builds on it to wait for a
//! cluster to leave the `Provisioning` phase.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::CloudResourceClient;
use crate::cluster::{ClusterId, Phase};
use crate::{Error, Result};

/// Interval between cluster status queries
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - Condition met, return the value
/// - `Ok(None)` - Condition not met yet, keep polling
/// - `Err(e)` - Fatal error, stop polling immediately
pub type PollResult<T> = Result<Option<T>>;

/// Run `future` unless `cancel` fires first
pub async fn cancellable<T, Fut>(cancel: &CancellationToken, future: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}

/// Poll `check_fn` every `interval` until it yields a value.
///
/// The first check runs after one interval. There is no overall deadline;
/// callers that need one cancel the token. Cancellation interrupts both the
/// sleep and an in-flight check and returns `Error::Cancelled`.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    cancel: &CancellationToken,
    description: &str,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    loop {
        cancellable(cancel, async {
            tokio::time::sleep(interval).await;
            Ok(())
        })
        .await?;

        match cancellable(cancel, check_fn()).await? {
            Some(value) => return Ok(value),
            None => debug!("Waiting for {}...", description),
        }
    }
}

/// Waits for an asynchronously provisioned cluster to reach a terminal phase
pub struct StatusPoller {
    client: Arc<dyn CloudResourceClient>,
    interval: Duration,
}

impl StatusPoller {
    /// Create a poller querying every [`DEFAULT_POLL_INTERVAL`]
    pub fn new(client: Arc<dyn CloudResourceClient>) -> Self {
        Self {
            client,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the query interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Block until the cluster is running or has failed.
    ///
    /// Returns `Phase::Running` on success. `Error`, `Deleting` and `Absent`
    /// become `ProvisioningFailed`. Transient query errors are retried; any
    /// other query error is returned unchanged.
    pub async fn wait(&self, id: &ClusterId, cancel: &CancellationToken) -> Result<Phase> {
        info!(cluster = %id, "Waiting for cluster to finish provisioning");
        let client = &self.client;

        poll_until(self.interval, cancel, "cluster provisioning", || async move {
            let status = match client.get_cluster_phase(id).await {
                Ok(status) => status,
                Err(e) if e.is_transient() => {
                    warn!(cluster = %id, error = %e, "Failed to query cluster status, retrying");
                    return Ok(None);
                }
                Err(e) if e.is_not_found() => {
                    return Err(Error::provisioning_failed(format!(
                        "cluster {} no longer exists ({})",
                        id,
                        Phase::Absent
                    )));
                }
                Err(e) => return Err(e),
            };

            match status.phase {
                Phase::Provisioning => Ok(None),
                Phase::Running => {
                    info!(cluster = %id, "Cluster is running");
                    Ok(Some(Phase::Running))
                }
                Phase::Error => Err(Error::provisioning_failed(format!(
                    "{}; additional error information may be found on the cluster's page in the GCP console: {}",
                    status.message,
                    id.console_url()
                ))),
                phase @ (Phase::Deleting | Phase::Absent) => Err(Error::provisioning_failed(
                    format!("cluster {} entered phase {} while provisioning", id, phase),
                )),
            }
        })
        .await
    }
}
