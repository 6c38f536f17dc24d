//! Cluster provisioning
//!
//! Drives the up-sequence as an explicit state machine:
//!
//! ```text
//! Start -> BucketCreated -> ClusterRequested -> ClusterReady -> BootstrapRan
//!       -> EnvironmentRegistered -> Done
//! ```
//!
//! Any failure moves to `Aborting`, which unwinds the compensation stack
//! before the error is returned. Only the bucket has a compensation: cluster
//! deletion is slow and destroys the diagnostic state an operator needs, so a
//! cluster that was requested is left for `cluster down`. A failure to write
//! the environment record rolls nothing back because the cluster is already
//! usable. Cancellation aborts without rolling back.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ClusterConfigCache;
use crate::cloud::{BootstrapExecutor, CloudResourceClient};
use crate::cluster::{BucketHandle, ClusterId};
use crate::compensation::{CompensationStack, RollbackFailure};
use crate::config::UpConfig;
use crate::environment::{EnvironmentRegistrar, UpsertOutcome, LOCAL_ENVIRONMENT};
use crate::poll::{cancellable, StatusPoller};
use crate::Error;

/// States of the up-sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionState {
    /// Nothing created yet
    Start,
    /// Bucket exists
    BucketCreated,
    /// Cluster creation accepted by the provider
    ClusterRequested,
    /// Cluster is running
    ClusterReady,
    /// Install script finished
    BootstrapRan,
    /// Environment record points at the cluster
    EnvironmentRegistered,
    /// Sequence complete
    Done,
    /// A step failed and rollback is running
    Aborting,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::BucketCreated => write!(f, "BucketCreated"),
            Self::ClusterRequested => write!(f, "ClusterRequested"),
            Self::ClusterReady => write!(f, "ClusterReady"),
            Self::BootstrapRan => write!(f, "BootstrapRan"),
            Self::EnvironmentRegistered => write!(f, "EnvironmentRegistered"),
            Self::Done => write!(f, "Done"),
            Self::Aborting => write!(f, "Aborting"),
        }
    }
}

/// Result of a successful up
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionOutcome {
    /// Bucket backing the cluster
    pub bucket: BucketHandle,
    /// The new cluster
    pub cluster: ClusterId,
    /// Operator URL reported by the bootstrap
    pub operator_endpoint: String,
    /// Environment that was configured
    pub environment: String,
    /// What happened to the environment record
    pub registration: UpsertOutcome,
}

/// A failed up, with the resources that still exist afterwards
#[derive(Debug, thiserror::Error)]
#[error("{cause}")]
pub struct ProvisionFailure {
    /// Last state reached before the failing step
    pub failed_at: ProvisionState,
    /// Root cause
    pub cause: Error,
    /// Bucket that still exists (rollback failed, skipped, or not attempted)
    pub bucket: Option<BucketHandle>,
    /// Cluster that still exists; never deleted automatically
    pub cluster: Option<ClusterId>,
    /// Operator endpoint reported by the bootstrap, if it got that far
    pub operator_endpoint: Option<String>,
    /// Rollback actions that failed
    pub rollback_failures: Vec<RollbackFailure>,
}

impl ProvisionFailure {
    fn before_start(cause: Error) -> Self {
        Self {
            failed_at: ProvisionState::Start,
            cause,
            bucket: None,
            cluster: None,
            operator_endpoint: None,
            rollback_failures: Vec::new(),
        }
    }

    /// True if the cloud resources are fine and only local bookkeeping failed
    pub fn is_warning(&self) -> bool {
        self.cause.is_warning()
    }

    /// Steps the operator must take by hand, if any
    pub fn manual_cleanup(&self) -> Vec<String> {
        let mut steps = Vec::new();
        if self.is_warning() {
            return steps;
        }
        if let Some(cluster) = &self.cluster {
            steps.push(format!(
                "cluster {} was not deleted; inspect it at {} and remove it with `cluster down`",
                cluster,
                cluster.console_url()
            ));
        }
        if let Some(bucket) = &self.bucket {
            steps.push(format!(
                "bucket {} was not deleted; remove it via the GCP console",
                bucket
            ));
        }
        steps
    }
}

/// Drives the up-sequence for one cluster
pub struct ProvisionOrchestrator {
    client: Arc<dyn CloudResourceClient>,
    bootstrap: Arc<dyn BootstrapExecutor>,
    registrar: EnvironmentRegistrar,
    cache: Option<ClusterConfigCache>,
    poller: StatusPoller,
}

impl ProvisionOrchestrator {
    /// Create an orchestrator
    pub fn new(
        client: Arc<dyn CloudResourceClient>,
        bootstrap: Arc<dyn BootstrapExecutor>,
        registrar: EnvironmentRegistrar,
    ) -> Self {
        Self {
            poller: StatusPoller::new(client.clone()),
            client,
            bootstrap,
            registrar,
            cache: None,
        }
    }

    /// Cache the provisioned spec so teardown can find it
    pub fn with_cache(mut self, cache: ClusterConfigCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the cluster status poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller = StatusPoller::new(self.client.clone()).with_interval(interval);
        self
    }

    /// Provision the bucket and cluster, bootstrap it and register the environment
    pub async fn up(
        &self,
        config: &UpConfig,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, ProvisionFailure> {
        let spec = &config.spec;
        spec.validate().map_err(ProvisionFailure::before_start)?;
        if config.environment == LOCAL_ENVIRONMENT {
            return Err(ProvisionFailure::before_start(Error::validation(format!(
                "the {} environment cannot be used with the gcp provider; use a different --configure-env",
                LOCAL_ENVIRONMENT
            ))));
        }

        let bucket = spec.bucket();
        let mut rollback = CompensationStack::new();

        // Start -> BucketCreated
        info!(bucket = %bucket, "Creating bucket");
        if let Err(e) = cancellable(cancel, self.client.create_bucket(&bucket)).await {
            return Err(self.abort(ProvisionState::Start, e, rollback, None, None).await);
        }
        let client = self.client.clone();
        let created = bucket.clone();
        rollback.push(format!("delete bucket {}", bucket), move || {
            async move { client.delete_bucket(&created).await }.boxed()
        });
        let state = ProvisionState::BucketCreated;

        // BucketCreated -> ClusterRequested
        info!(cluster = %spec.id(), state = %state, "Creating GKE cluster");
        let cluster = match cancellable(cancel, self.client.create_cluster(spec)).await {
            Ok(id) => id,
            Err(e) => return Err(self.abort(state, e, rollback, Some(&bucket), None).await),
        };
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.write(spec) {
                warn!(error = %e, "Failed to cache cluster config");
            }
        }
        let state = ProvisionState::ClusterRequested;

        // ClusterRequested -> ClusterReady
        if let Err(e) = self.poller.wait(&cluster, cancel).await {
            return Err(self
                .abort(state, e, rollback, Some(&bucket), Some(&cluster))
                .await);
        }
        let state = ProvisionState::ClusterReady;

        // ClusterReady -> BootstrapRan
        info!(cluster = %cluster, state = %state, "Bootstrapping cluster");
        let output = match cancellable(cancel, self.bootstrap.run(spec, &bucket)).await {
            Ok(output) => output,
            Err(e) => {
                return Err(self
                    .abort(state, e, rollback, Some(&bucket), Some(&cluster))
                    .await)
            }
        };
        let state = ProvisionState::BootstrapRan;

        // Cloud resources are complete; nothing below rolls them back
        rollback.commit();

        // BootstrapRan -> EnvironmentRegistered -> Done
        info!(environment = %config.environment, state = %state, "Configuring environment");
        let upsert = self
            .registrar
            .upsert(&config.environment, &output.operator_endpoint);
        let registration = match cancellable(cancel, upsert).await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => {
                return Err(ProvisionFailure {
                    failed_at: state,
                    cause: Error::Cancelled,
                    bucket: Some(bucket),
                    cluster: Some(cluster),
                    operator_endpoint: Some(output.operator_endpoint),
                    rollback_failures: Vec::new(),
                })
            }
            Err(e) => {
                warn!(
                    environment = %config.environment,
                    error = %e,
                    "Cluster is ready but the environment could not be configured"
                );
                return Err(ProvisionFailure {
                    failed_at: state,
                    cause: Error::environment_registration(e.to_string()),
                    bucket: Some(bucket),
                    cluster: Some(cluster),
                    operator_endpoint: Some(output.operator_endpoint),
                    rollback_failures: Vec::new(),
                });
            }
        };
        info!(cluster = %cluster, state = %ProvisionState::Done, "Cluster is up");

        Ok(ProvisionOutcome {
            bucket,
            cluster,
            operator_endpoint: output.operator_endpoint,
            environment: config.environment.clone(),
            registration,
        })
    }

    async fn abort(
        &self,
        failed_at: ProvisionState,
        cause: Error,
        rollback: CompensationStack,
        bucket: Option<&BucketHandle>,
        cluster: Option<&ClusterId>,
    ) -> ProvisionFailure {
        error!(
            state = %failed_at,
            next = %ProvisionState::Aborting,
            error = %cause,
            "Provisioning failed"
        );

        let (bucket_remains, rollback_failures) = if matches!(cause, Error::Cancelled) {
            warn!("Cancelled; skipping rollback");
            rollback.commit();
            (bucket.is_some(), Vec::new())
        } else if rollback.is_empty() {
            debug!("Nothing to roll back");
            (bucket.is_some(), Vec::new())
        } else {
            debug!(pending = ?rollback, "Unwinding");
            let failures = rollback.unwind().await;
            (!failures.is_empty(), failures)
        };

        if let Some(cluster) = cluster {
            warn!(
                cluster = %cluster,
                console = %cluster.console_url(),
                "Cluster was left in place for inspection; remove it with `cluster down`"
            );
        }

        ProvisionFailure {
            failed_at,
            cause,
            bucket: bucket.filter(|_| bucket_remains).cloned(),
            cluster: cluster.cloned(),
            operator_endpoint: None,
            rollback_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{BootstrapOutput, MockBootstrapExecutor, MockCloudResourceClient};
    use crate::cluster::{ClusterSpec, ClusterStatus, Phase};
    use crate::environment::{MockConfirm, MockEnvironmentStore};
    use std::sync::Mutex;

    const ENDPOINT: &str = "https://34.68.12.5";

    fn sample_config() -> UpConfig {
        UpConfig::new(ClusterSpec::new("c1", "p1", "z1", "n1-standard-4", 1, 3))
    }

    /// Records every call the orchestrator makes, in order
    #[derive(Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<String>>>);

    impl CallLog {
        fn record(&self, call: impl Into<String>) {
            self.0.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn contains(&self, call: &str) -> bool {
            self.calls().iter().any(|c| c == call)
        }
    }

    /// Cloud mock where every step succeeds unless overridden
    fn cloud(log: &CallLog) -> MockCloudResourceClient {
        let mut mock = MockCloudResourceClient::new();
        let l = log.clone();
        mock.expect_create_bucket().returning(move |b| {
            l.record(format!("create_bucket {}", b));
            Ok(())
        });
        let l = log.clone();
        mock.expect_delete_bucket().returning(move |b| {
            l.record(format!("delete_bucket {}", b));
            Ok(())
        });
        let l = log.clone();
        mock.expect_create_cluster().returning(move |spec| {
            l.record(format!("create_cluster {}", spec.cluster_name));
            Ok(spec.id())
        });
        let l = log.clone();
        mock.expect_delete_cluster().returning(move |id| {
            l.record(format!("delete_cluster {}", id.name));
            Ok(())
        });
        mock.expect_get_cluster_phase()
            .returning(|_| Ok(ClusterStatus::new(Phase::Running)));
        mock
    }

    fn bootstrap_ok() -> MockBootstrapExecutor {
        let mut mock = MockBootstrapExecutor::new();
        mock.expect_run().returning(|_, _| {
            Ok(BootstrapOutput {
                operator_endpoint: ENDPOINT.to_string(),
            })
        });
        mock
    }

    fn registrar(store: MockEnvironmentStore) -> EnvironmentRegistrar {
        let mut confirm = MockConfirm::new();
        confirm.expect_confirm().never();
        EnvironmentRegistrar::new(Arc::new(store), Arc::new(confirm), true)
    }

    fn empty_store(log: &CallLog) -> MockEnvironmentStore {
        let mut store = MockEnvironmentStore::new();
        store.expect_get().returning(|_| Ok(None));
        let l = log.clone();
        store.expect_put().returning(move |r| {
            l.record(format!("put_env {} {} {}", r.name, r.provider, r.operator_endpoint));
            Ok(())
        });
        store
    }

    fn orchestrator(
        cloud: MockCloudResourceClient,
        bootstrap: MockBootstrapExecutor,
        store: MockEnvironmentStore,
    ) -> ProvisionOrchestrator {
        ProvisionOrchestrator::new(Arc::new(cloud), Arc::new(bootstrap), registrar(store))
            .with_poll_interval(Duration::from_millis(1))
    }

    // ===== Happy path =====

    /// Story: a full up creates bucket then cluster, bootstraps, and points
    /// the environment at the operator
    #[tokio::test]
    async fn story_successful_up_runs_every_step_in_order() {
        let log = CallLog::default();
        let orchestrator = orchestrator(cloud(&log), bootstrap_ok(), empty_store(&log));

        let outcome = orchestrator
            .up(&sample_config(), &CancellationToken::new())
            .await
            .expect("up should succeed");

        assert_eq!(outcome.bucket.name(), "cortex-c1-p1-z1");
        assert_eq!(outcome.cluster, ClusterId::new("p1", "z1", "c1"));
        assert_eq!(outcome.operator_endpoint, ENDPOINT);
        assert_eq!(outcome.registration, UpsertOutcome::Created);
        assert_eq!(
            log.calls(),
            vec![
                "create_bucket cortex-c1-p1-z1".to_string(),
                "create_cluster c1".to_string(),
                format!("put_env gcp gcp {}", ENDPOINT),
            ]
        );
    }

    // ===== Rollback =====

    /// Story: if the cluster cannot be created the bucket is removed before
    /// the error is returned, and the provider's cause is preserved
    #[tokio::test]
    async fn story_cluster_creation_failure_deletes_bucket() {
        let log = CallLog::default();
        let mut cloud = MockCloudResourceClient::new();
        let l = log.clone();
        cloud.expect_create_bucket().returning(move |b| {
            l.record(format!("create_bucket {}", b));
            Ok(())
        });
        cloud
            .expect_create_cluster()
            .returning(|_| Err(Error::quota_exceeded("CPUS")));
        let l = log.clone();
        cloud.expect_delete_bucket().times(1).returning(move |b| {
            l.record(format!("delete_bucket {}", b));
            Ok(())
        });
        cloud.expect_delete_cluster().never();
        let mut store = MockEnvironmentStore::new();
        store.expect_put().never();
        store.expect_get().never();

        let failure = orchestrator(cloud, MockBootstrapExecutor::new(), store)
            .up(&sample_config(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::QuotaExceeded(_)));
        assert_eq!(failure.failed_at, ProvisionState::BucketCreated);
        assert!(failure.bucket.is_none());
        assert!(failure.cluster.is_none());
        assert!(log.contains("delete_bucket cortex-c1-p1-z1"));
    }

    /// Story: a bucket that already exists aborts immediately with nothing
    /// to roll back
    #[tokio::test]
    async fn story_bucket_failure_has_nothing_to_roll_back() {
        let mut cloud = MockCloudResourceClient::new();
        cloud
            .expect_create_bucket()
            .returning(|b| Err(Error::already_exists(b.to_string())));
        cloud.expect_delete_bucket().never();
        cloud.expect_create_cluster().never();

        let failure = orchestrator(cloud, MockBootstrapExecutor::new(), MockEnvironmentStore::new())
            .up(&sample_config(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::AlreadyExists(_)));
        assert_eq!(failure.failed_at, ProvisionState::Start);
        assert!(failure.rollback_failures.is_empty());
    }

    /// Story: an errored cluster is kept for inspection; only the bucket goes
    #[tokio::test]
    async fn story_provisioning_failure_keeps_cluster() {
        let log = CallLog::default();
        let mut cloud = MockCloudResourceClient::new();
        let l = log.clone();
        cloud.expect_create_bucket().returning(|_| Ok(()));
        cloud.expect_create_cluster().returning(|spec| Ok(spec.id()));
        cloud.expect_delete_bucket().times(1).returning(move |b| {
            l.record(format!("delete_bucket {}", b));
            Ok(())
        });
        cloud.expect_delete_cluster().never();
        cloud.expect_get_cluster_phase().returning(|_| {
            Ok(ClusterStatus::with_message(Phase::Error, "node pool failed to start"))
        });
        let mut bootstrap = MockBootstrapExecutor::new();
        bootstrap.expect_run().never();

        let failure = orchestrator(cloud, bootstrap, MockEnvironmentStore::new())
            .up(&sample_config(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::ProvisioningFailed(_)));
        assert_eq!(failure.failed_at, ProvisionState::ClusterRequested);
        assert_eq!(failure.cluster, Some(ClusterId::new("p1", "z1", "c1")));
        assert!(failure.bucket.is_none());
        assert!(log.contains("delete_bucket cortex-c1-p1-z1"));
        assert_eq!(failure.manual_cleanup().len(), 1);
    }

    /// Story: a failed bootstrap never deletes the half-initialised cluster
    #[tokio::test]
    async fn story_bootstrap_failure_rolls_back_bucket_only() {
        let mut cloud = MockCloudResourceClient::new();
        cloud.expect_create_bucket().returning(|_| Ok(()));
        cloud.expect_create_cluster().returning(|spec| Ok(spec.id()));
        cloud
            .expect_get_cluster_phase()
            .returning(|_| Ok(ClusterStatus::new(Phase::Running)));
        cloud.expect_delete_bucket().times(1).returning(|_| Ok(()));
        cloud.expect_delete_cluster().never();
        let mut bootstrap = MockBootstrapExecutor::new();
        bootstrap
            .expect_run()
            .returning(|_, _| Err(Error::bootstrap("install.sh exited with 1")));
        let mut store = MockEnvironmentStore::new();
        store.expect_put().never();

        let failure = orchestrator(cloud, bootstrap, store)
            .up(&sample_config(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::Bootstrap(_)));
        assert_eq!(failure.failed_at, ProvisionState::ClusterReady);
        assert!(failure.cluster.is_some());
        assert!(failure.bucket.is_none());
    }

    /// Story: a failing rollback is reported alongside, never instead of,
    /// the original cause
    #[tokio::test]
    async fn story_rollback_failure_does_not_mask_cause() {
        let mut cloud = MockCloudResourceClient::new();
        cloud.expect_create_bucket().returning(|_| Ok(()));
        cloud
            .expect_create_cluster()
            .returning(|_| Err(Error::invalid_spec("machine type n1-nope not found")));
        cloud
            .expect_delete_bucket()
            .returning(|_| Err(Error::transient("503")));

        let failure = orchestrator(cloud, MockBootstrapExecutor::new(), MockEnvironmentStore::new())
            .up(&sample_config(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::InvalidSpec(_)));
        assert_eq!(failure.rollback_failures.len(), 1);
        assert_eq!(failure.bucket.as_ref().map(|b| b.name()), Some("cortex-c1-p1-z1"));
        assert!(failure.to_string().contains("n1-nope"));
    }

    // ===== Environment registration =====

    /// Story: the cluster is usable even when the environment write fails,
    /// so nothing is rolled back and the error is warning-class
    #[tokio::test]
    async fn story_registration_failure_is_warning_without_rollback() {
        let log = CallLog::default();
        let mut store = MockEnvironmentStore::new();
        store.expect_get().returning(|_| Ok(None));
        store
            .expect_put()
            .returning(|_| Err(Error::config("read-only file system")));

        let failure = orchestrator(cloud(&log), bootstrap_ok(), store)
            .up(&sample_config(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(failure.is_warning());
        assert_eq!(failure.failed_at, ProvisionState::BootstrapRan);
        assert!(failure.bucket.is_some());
        assert!(failure.cluster.is_some());
        assert!(failure.manual_cleanup().is_empty());
        assert_eq!(failure.operator_endpoint.as_deref(), Some(ENDPOINT));
        assert!(!log.calls().iter().any(|c| c.starts_with("delete_")));
    }

    // ===== Preconditions and cancellation =====

    #[tokio::test]
    async fn test_local_environment_rejected_before_any_call() {
        let mut cloud = MockCloudResourceClient::new();
        cloud.expect_create_bucket().never();
        let mut config = sample_config();
        config.environment = "local".to_string();

        let failure = orchestrator(cloud, MockBootstrapExecutor::new(), MockEnvironmentStore::new())
            .up(&config, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_invalid_spec_rejected_before_any_call() {
        let mut cloud = MockCloudResourceClient::new();
        cloud.expect_create_bucket().never();
        let mut config = sample_config();
        config.spec.min_instances = 10;

        let failure = orchestrator(cloud, MockBootstrapExecutor::new(), MockEnvironmentStore::new())
            .up(&config, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::Validation(_)));
    }

    /// Story: cancelling while the cluster provisions stops immediately and
    /// leaves everything for a later `cluster down`
    #[tokio::test]
    async fn story_cancel_during_polling_skips_rollback() {
        let mut cloud = MockCloudResourceClient::new();
        cloud.expect_create_bucket().returning(|_| Ok(()));
        cloud.expect_create_cluster().returning(|spec| Ok(spec.id()));
        cloud
            .expect_get_cluster_phase()
            .returning(|_| Ok(ClusterStatus::new(Phase::Provisioning)));
        cloud.expect_delete_bucket().never();
        cloud.expect_delete_cluster().never();

        let orchestrator = orchestrator(cloud, MockBootstrapExecutor::new(), MockEnvironmentStore::new());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let config = sample_config();

        let (result, ()) = tokio::join!(orchestrator.up(&config, &cancel), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let failure = result.unwrap_err();
        assert!(matches!(failure.cause, Error::Cancelled));
        assert_eq!(failure.failed_at, ProvisionState::ClusterRequested);
        assert!(failure.bucket.is_some());
        assert!(failure.cluster.is_some());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProvisionState::ClusterRequested.to_string(), "ClusterRequested");
        assert_eq!(ProvisionState::Aborting.to_string(), "Aborting");
    }
}
