//! Cloud collaborators of the orchestrators
//!
//! The orchestrators only talk to the outside world through the two traits in
//! this module, so they can be driven by mocks in tests and by the GCP
//! implementations ([`gcp::GcpClient`], [`bootstrap::DockerBootstrapExecutor`])
//! in production.

pub mod auth;
pub mod bootstrap;
pub mod gcp;
pub mod gke;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::cluster::{BucketHandle, ClusterId, ClusterSpec, ClusterStatus};
use crate::Result;

pub use bootstrap::{BootstrapOutput, DockerBootstrapExecutor};
pub use gcp::GcpClient;

/// Create/delete/get operations against the bucket and the managed cluster
///
/// Errors follow the crate taxonomy: `AlreadyExists`, `NotFound`,
/// `PermissionDenied`, `QuotaExceeded`, `InvalidSpec` and `Transient`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudResourceClient: Send + Sync {
    /// Create the bucket. Fails with `AlreadyExists` if the name is taken.
    async fn create_bucket(&self, bucket: &BucketHandle) -> Result<()>;

    /// Delete the bucket and its contents. Deleting an absent bucket succeeds.
    async fn delete_bucket(&self, bucket: &BucketHandle) -> Result<()>;

    /// Submit cluster creation. Returns once the request is accepted, not
    /// when the cluster is ready.
    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<ClusterId>;

    /// Submit cluster deletion. Fails with `NotFound` if the cluster is gone.
    async fn delete_cluster(&self, id: &ClusterId) -> Result<()>;

    /// Current phase of the cluster
    async fn get_cluster_phase(&self, id: &ClusterId) -> Result<ClusterStatus>;
}

/// Runs the install script that finishes configuring a new cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapExecutor: Send + Sync {
    /// Bootstrap the cluster using `bucket` for artifact exchange
    async fn run(&self, spec: &ClusterSpec, bucket: &BucketHandle) -> Result<BootstrapOutput>;
}
