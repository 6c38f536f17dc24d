//! Cluster teardown
//!
//! Best-effort removal: the bucket goes first and its failure is only a
//! warning, then the cluster deletion is submitted, then the cached config is
//! purged whatever happened before. Deletion is not awaited.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ClusterConfigCache;
use crate::cloud::CloudResourceClient;
use crate::cluster::{BucketHandle, ClusterId};
use crate::config::DownConfig;
use crate::poll::cancellable;
use crate::Error;

/// What happened to the cluster during teardown
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterDeletion {
    /// Deletion was accepted by the provider
    Submitted,
    /// The cluster did not exist
    AlreadyGone,
}

/// Per-step result of a successful down
#[derive(Debug)]
pub struct TeardownReport {
    /// Cluster that was removed
    pub cluster: ClusterId,
    /// Bucket derived from the cluster identity
    pub bucket: BucketHandle,
    /// Why the bucket could not be deleted, if it could not
    pub bucket_warning: Option<Error>,
    /// Cluster outcome
    pub deletion: ClusterDeletion,
    /// Whether the cached config was removed
    pub cache_purged: bool,
}

impl TeardownReport {
    /// True if the bucket was removed (or was already absent)
    pub fn bucket_deleted(&self) -> bool {
        self.bucket_warning.is_none()
    }
}

/// A down whose cluster deletion failed
#[derive(Debug, thiserror::Error)]
#[error("failed to delete cluster {cluster}: {cause}")]
pub struct TeardownFailure {
    /// Cluster that could not be removed
    pub cluster: ClusterId,
    /// Root cause
    #[source]
    pub cause: Error,
    /// Whether the bucket was removed before the failure
    pub bucket_deleted: bool,
    /// Whether the cached config was removed
    pub cache_purged: bool,
}

/// Drives the down-sequence for one cluster
pub struct TeardownOrchestrator {
    client: Arc<dyn CloudResourceClient>,
    cache: Option<ClusterConfigCache>,
}

impl TeardownOrchestrator {
    /// Create an orchestrator
    pub fn new(client: Arc<dyn CloudResourceClient>) -> Self {
        Self {
            client,
            cache: None,
        }
    }

    /// Purge cached configs from this cache
    pub fn with_cache(mut self, cache: ClusterConfigCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Delete the bucket and cluster, then purge the cached config.
    ///
    /// Cancellation stops immediately and leaves the cache in place.
    pub async fn down(
        &self,
        config: &DownConfig,
        cancel: &CancellationToken,
    ) -> Result<TeardownReport, TeardownFailure> {
        let cluster = config.cluster_id();
        let bucket = cluster.bucket();

        info!(bucket = %bucket, "Deleting bucket");
        let bucket_warning = match cancellable(cancel, self.client.delete_bucket(&bucket)).await {
            Ok(()) => None,
            Err(Error::Cancelled) => {
                return Err(TeardownFailure {
                    cluster,
                    cause: Error::Cancelled,
                    bucket_deleted: false,
                    cache_purged: false,
                })
            }
            Err(e) => {
                warn!(bucket = %bucket, error = %e, "Failed to delete bucket, continuing");
                Some(e)
            }
        };
        let bucket_deleted = bucket_warning.is_none();

        info!(cluster = %cluster, "Deleting GKE cluster");
        let deletion = match cancellable(cancel, self.client.delete_cluster(&cluster)).await {
            Ok(()) => ClusterDeletion::Submitted,
            Err(e) if e.is_not_found() => {
                info!(cluster = %cluster, "Cluster does not exist");
                ClusterDeletion::AlreadyGone
            }
            Err(Error::Cancelled) => {
                return Err(TeardownFailure {
                    cluster,
                    cause: Error::Cancelled,
                    bucket_deleted,
                    cache_purged: false,
                })
            }
            Err(cause) => {
                error!(cluster = %cluster, error = %cause, "Failed to delete cluster");
                let cache_purged = self.purge_cache(&cluster);
                return Err(TeardownFailure {
                    cluster,
                    cause,
                    bucket_deleted,
                    cache_purged,
                });
            }
        };

        let cache_purged = self.purge_cache(&cluster);
        info!(cluster = %cluster, ?deletion, "Cluster deletion submitted");

        Ok(TeardownReport {
            cluster,
            bucket,
            bucket_warning,
            deletion,
            cache_purged,
        })
    }

    fn purge_cache(&self, cluster: &ClusterId) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match cache.purge(cluster) {
            Ok(()) => true,
            Err(e) => {
                debug!(cluster = %cluster, error = %e, "Ignoring cache purge failure");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudResourceClient;
    use crate::cluster::ClusterSpec;

    fn down_config() -> DownConfig {
        DownConfig {
            cluster_name: "c1".to_string(),
            project: "p1".to_string(),
            zone: "z1".to_string(),
            disallow_prompt: true,
        }
    }

    fn cached(dir: &tempfile::TempDir) -> ClusterConfigCache {
        let cache = ClusterConfigCache::new(dir.path());
        cache
            .write(&ClusterSpec::new("c1", "p1", "z1", "n1-standard-4", 1, 3))
            .unwrap();
        cache
    }

    /// Story: a normal down removes bucket, cluster and cached config
    #[tokio::test]
    async fn story_down_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cached(&dir);
        let mut cloud = MockCloudResourceClient::new();
        cloud
            .expect_delete_bucket()
            .withf(|b| b.name() == "cortex-c1-p1-z1")
            .times(1)
            .returning(|_| Ok(()));
        cloud
            .expect_delete_cluster()
            .withf(|id| id.resource_name() == "projects/p1/locations/z1/clusters/c1")
            .times(1)
            .returning(|_| Ok(()));

        let report = TeardownOrchestrator::new(Arc::new(cloud))
            .with_cache(cache.clone())
            .down(&down_config(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.bucket_deleted());
        assert_eq!(report.deletion, ClusterDeletion::Submitted);
        assert!(report.cache_purged);
        assert!(!cache.path(&report.cluster).exists());
    }

    /// Story: a bucket that cannot be deleted does not stop cluster deletion
    #[tokio::test]
    async fn story_bucket_failure_is_only_a_warning() {
        let mut cloud = MockCloudResourceClient::new();
        cloud
            .expect_delete_bucket()
            .returning(|_| Err(Error::permission_denied("storage.buckets.delete")));
        cloud.expect_delete_cluster().times(1).returning(|_| Ok(()));

        let report = TeardownOrchestrator::new(Arc::new(cloud))
            .down(&down_config(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.bucket_deleted());
        assert!(matches!(report.bucket_warning, Some(Error::PermissionDenied(_))));
        assert_eq!(report.deletion, ClusterDeletion::Submitted);
    }

    #[tokio::test]
    async fn test_missing_cluster_is_success() {
        let mut cloud = MockCloudResourceClient::new();
        cloud.expect_delete_bucket().returning(|_| Ok(()));
        cloud
            .expect_delete_cluster()
            .returning(|id| Err(Error::not_found(id.to_string())));

        let report = TeardownOrchestrator::new(Arc::new(cloud))
            .down(&down_config(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.deletion, ClusterDeletion::AlreadyGone);
    }

    /// Story: a failed cluster deletion fails the down but the cache is
    /// still purged and the bucket result is reported
    #[tokio::test]
    async fn story_cluster_failure_is_fatal_but_cache_still_purged() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cached(&dir);
        let mut cloud = MockCloudResourceClient::new();
        cloud.expect_delete_bucket().returning(|_| Ok(()));
        cloud
            .expect_delete_cluster()
            .returning(|_| Err(Error::transient("503")));

        let failure = TeardownOrchestrator::new(Arc::new(cloud))
            .with_cache(cache.clone())
            .down(&down_config(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::Transient(_)));
        assert!(failure.bucket_deleted);
        assert!(failure.cache_purged);
        assert!(!cache.path(&failure.cluster).exists());
        assert!(failure.to_string().contains("c1"));
    }

    #[tokio::test]
    async fn test_cancelled_down_keeps_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cached(&dir);
        let mut cloud = MockCloudResourceClient::new();
        cloud.expect_delete_bucket().returning(|_| Ok(()));
        cloud.expect_delete_cluster().never();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = TeardownOrchestrator::new(Arc::new(cloud))
            .with_cache(cache.clone())
            .down(&down_config(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::Cancelled));
        assert!(!failure.cache_purged);
        assert!(cache.path(&failure.cluster).exists());
    }
}
