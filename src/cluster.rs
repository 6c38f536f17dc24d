//! Cluster data model
//!
//! [`ClusterSpec`] is the user-supplied descriptor, [`ClusterId`] the identity
//! of the remote cluster, [`BucketHandle`] the bucket derived from that identity
//! and [`Phase`] the closed set of lifecycle states the poller understands.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix for every bucket created on behalf of a cluster
pub const BUCKET_PREFIX: &str = "cortex";

/// Cloud Storage bucket names are limited to 63 characters
const MAX_BUCKET_NAME_LEN: usize = 63;

/// GKE cluster names are limited to 40 characters
const MAX_CLUSTER_NAME_LEN: usize = 40;

fn default_operator_machine_type() -> String {
    "n1-standard-2".to_string()
}

fn default_cluster_version() -> String {
    "1.17".to_string()
}

/// Supported cluster providers for environment records
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Local docker environment
    Local,
    /// Amazon Web Services
    Aws,
    /// Google Cloud Platform
    #[default]
    Gcp,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Aws => write!(f, "aws"),
            Self::Gcp => write!(f, "gcp"),
        }
    }
}

/// Scheduling effect of a node taint
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum TaintEffect {
    /// Pods without a toleration are not scheduled
    NoSchedule,
    /// Scheduler avoids the node when possible
    PreferNoSchedule,
    /// Running pods without a toleration are evicted
    NoExecute,
}

impl TaintEffect {
    /// GKE API enum value
    pub fn as_gke(&self) -> &'static str {
        match self {
            Self::NoSchedule => "NO_SCHEDULE",
            Self::PreferNoSchedule => "PREFER_NO_SCHEDULE",
            Self::NoExecute => "NO_EXECUTE",
        }
    }
}

/// Taint applied to worker nodes
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeTaint {
    /// Taint key
    pub key: String,
    /// Taint value
    pub value: String,
    /// Taint effect
    pub effect: TaintEffect,
}

/// Descriptor of the cluster to provision
///
/// Loaded from the `--config` YAML file. The spec is never mutated once
/// provisioning starts; a copy is cached locally so teardown can find it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Cluster name, unique within (project, zone)
    pub cluster_name: String,
    /// GCP project id
    pub project: String,
    /// GCP zone, e.g. `us-central1-a`
    pub zone: String,
    /// Machine type of the worker node pool
    pub instance_type: String,
    /// Optional accelerator attached to each worker, e.g. `nvidia-tesla-t4`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_type: Option<String>,
    /// Lower autoscaling bound of the worker pool
    pub min_instances: u32,
    /// Upper autoscaling bound of the worker pool
    pub max_instances: u32,
    /// Extra labels for worker nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,
    /// Extra taints for worker nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_taints: Vec<NodeTaint>,
    /// Machine type of the single operator node
    #[serde(default = "default_operator_machine_type")]
    pub operator_machine_type: String,
    /// Initial Kubernetes version requested from GKE
    #[serde(default = "default_cluster_version")]
    pub cluster_version: String,
}

impl ClusterSpec {
    /// Create a spec with defaults for everything but identity, machine type
    /// and autoscaling bounds
    pub fn new(
        cluster_name: impl Into<String>,
        project: impl Into<String>,
        zone: impl Into<String>,
        instance_type: impl Into<String>,
        min_instances: u32,
        max_instances: u32,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            project: project.into(),
            zone: zone.into(),
            instance_type: instance_type.into(),
            accelerator_type: None,
            min_instances,
            max_instances,
            node_labels: BTreeMap::new(),
            node_taints: Vec::new(),
            operator_machine_type: default_operator_machine_type(),
            cluster_version: default_cluster_version(),
        }
    }

    /// Validate the spec before any remote call is made
    pub fn validate(&self) -> Result<()> {
        self.id().validate()?;

        if self.instance_type.trim().is_empty() {
            return Err(Error::validation("instance_type must not be empty"));
        }
        if self.min_instances > self.max_instances {
            return Err(Error::validation(format!(
                "min_instances ({}) must be less than or equal to max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if let Some(accelerator) = &self.accelerator_type {
            if accelerator.trim().is_empty() {
                return Err(Error::validation("accelerator_type must not be empty when set"));
            }
        }

        Ok(())
    }

    /// Identity of the cluster this spec describes
    pub fn id(&self) -> ClusterId {
        ClusterId::new(&self.project, &self.zone, &self.cluster_name)
    }

    /// Bucket that backs this cluster
    pub fn bucket(&self) -> BucketHandle {
        BucketHandle::for_cluster(&self.cluster_name, &self.project, &self.zone)
    }
}

fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("cluster name must not be empty"));
    }
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(Error::validation(format!(
            "cluster name '{}' is longer than {} characters",
            name, MAX_CLUSTER_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::validation(format!(
            "cluster name '{}' may only contain lowercase letters, digits and '-'",
            name
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(Error::validation(format!(
            "cluster name '{}' must start with a lowercase letter",
            name
        )));
    }
    if name.ends_with('-') {
        return Err(Error::validation(format!(
            "cluster name '{}' must not end with '-'",
            name
        )));
    }
    Ok(())
}

/// `extra` widens the character set; project ids may carry a `domain:`
/// prefix, e.g. `example.com:my-project`
fn validate_identity_part(what: &str, value: &str, extra: &[char]) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(format!("{} must not be empty", what)));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || extra.contains(&c))
    {
        return Err(Error::validation(format!(
            "{} '{}' may only contain lowercase letters, digits and '-'",
            what, value
        )));
    }
    Ok(())
}

/// Identity of a managed cluster: (project, zone, name)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct ClusterId {
    /// GCP project id
    pub project: String,
    /// GCP zone
    pub zone: String,
    /// Cluster name
    pub name: String,
}

impl ClusterId {
    /// Create a cluster identity
    pub fn new(project: impl Into<String>, zone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }

    /// Reject identities that cannot name a GKE cluster. Every part ends up
    /// in a URL path, so nothing outside the GCP character sets gets through.
    pub fn validate(&self) -> Result<()> {
        validate_cluster_name(&self.name)?;
        validate_identity_part("project", &self.project, &['.', ':'])?;
        validate_identity_part("zone", &self.zone, &[])
    }

    /// Parent resource path, `projects/<p>/locations/<z>`
    pub fn parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.zone)
    }

    /// Full resource path, `projects/<p>/locations/<z>/clusters/<n>`
    pub fn resource_name(&self) -> String {
        format!("{}/clusters/{}", self.parent(), self.name)
    }

    /// Bucket that backs this cluster
    pub fn bucket(&self) -> BucketHandle {
        BucketHandle::for_cluster(&self.name, &self.project, &self.zone)
    }

    /// Console page with details about the cluster
    pub fn console_url(&self) -> String {
        format!(
            "https://console.cloud.google.com/kubernetes/clusters/details/{}/{}?project={}",
            self.zone, self.name, self.project
        )
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (project: {}, zone: {})", self.name, self.project, self.zone)
    }
}

/// Name of the bucket that stores a cluster's bootstrap artifacts
///
/// Has no identity of its own: it is recomputed from the cluster identity
/// whenever needed, so teardown needs no persisted state to find it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketHandle(String);

impl BucketHandle {
    /// Derive the bucket for (cluster name, project, zone)
    pub fn for_cluster(cluster_name: &str, project: &str, zone: &str) -> Self {
        let mut name: String = format!("{}-{}-{}-{}", BUCKET_PREFIX, cluster_name, project, zone)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        if name.len() > MAX_BUCKET_NAME_LEN {
            name.truncate(MAX_BUCKET_NAME_LEN);
        }
        let trimmed = name.trim_end_matches('-').len();
        name.truncate(trimmed);
        Self(name)
    }

    /// Bucket name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observable lifecycle phase of a managed cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Creation accepted, nodes coming up
    Provisioning,
    /// Cluster is serving
    Running,
    /// Cluster failed on the provider side
    Error,
    /// Cluster is being removed
    Deleting,
    /// Cluster does not exist
    Absent,
}

impl Phase {
    /// Map a raw GKE `Cluster.status` value into the closed phase set
    ///
    /// Returns the phase and whether the raw value was recognised. Anything
    /// that is not provisioning, stopping or errored means the cluster is up.
    pub fn from_gke_status(status: &str) -> (Self, bool) {
        match status {
            "PROVISIONING" => (Self::Provisioning, true),
            "RUNNING" | "RECONCILING" | "DEGRADED" => (Self::Running, true),
            "STOPPING" => (Self::Deleting, true),
            "ERROR" => (Self::Error, true),
            _ => (Self::Running, false),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Running => write!(f, "Running"),
            Self::Error => write!(f, "Error"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Absent => write!(f, "Absent"),
        }
    }
}

/// Phase plus the provider's diagnostic message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterStatus {
    /// Observed phase
    pub phase: Phase,
    /// Provider `statusMessage`, empty when none was given
    pub message: String,
}

impl ClusterStatus {
    /// Status without a diagnostic message
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            message: String::new(),
        }
    }

    /// Status with a diagnostic message
    pub fn with_message(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> ClusterSpec {
        ClusterSpec::new("c1", "p1", "z1", "n1-standard-4", 1, 3)
    }

    mod bucket_naming {
        use super::*;

        #[test]
        fn test_bucket_name_from_identity() {
            let bucket = BucketHandle::for_cluster("c1", "p1", "z1");
            assert_eq!(bucket.name(), "cortex-c1-p1-z1");
        }

        /// Story: teardown recomputes the bucket name from flags alone, so
        /// the same identity must always produce the same name
        #[test]
        fn story_bucket_name_is_stable_across_up_and_down() {
            let up = sample_spec().bucket();
            let down = ClusterId::new("p1", "z1", "c1").bucket();
            assert_eq!(up, down);
            assert_eq!(up, BucketHandle::for_cluster("c1", "p1", "z1"));
        }

        #[test]
        fn test_bucket_name_is_lowercased() {
            let bucket = BucketHandle::for_cluster("c1", "My-Project", "US-East1-B");
            assert_eq!(bucket.name(), "cortex-c1-my-project-us-east1-b");
        }

        #[test]
        fn test_bucket_name_replaces_invalid_characters() {
            let bucket = BucketHandle::for_cluster("c1", "domain.com:p1", "z1");
            assert_eq!(bucket.name(), "cortex-c1-domain-com-p1-z1");
        }

        #[test]
        fn test_bucket_name_is_capped() {
            let bucket = BucketHandle::for_cluster(
                "a-very-long-cluster-name-for-testing",
                "some-long-project-id-123456",
                "europe-west4-a",
            );
            assert!(bucket.name().len() <= 63);
            assert!(!bucket.name().ends_with('-'));
            assert!(bucket.name().starts_with("cortex-a-very-long"));
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn test_valid_spec() {
            assert!(sample_spec().validate().is_ok());
        }

        #[test]
        fn test_equal_bounds_are_valid() {
            let spec = ClusterSpec::new("c1", "p1", "z1", "n1-standard-4", 0, 0);
            assert!(spec.validate().is_ok());
        }

        #[test]
        fn test_min_greater_than_max_rejected() {
            let spec = ClusterSpec::new("c1", "p1", "z1", "n1-standard-4", 4, 2);
            let err = spec.validate().unwrap_err();
            assert!(err.to_string().contains("min_instances (4)"));
        }

        #[test]
        fn test_bad_cluster_names_rejected() {
            for name in ["", "C1", "1cluster", "cluster-", "under_score"] {
                let mut spec = sample_spec();
                spec.cluster_name = name.to_string();
                assert!(spec.validate().is_err(), "expected '{}' to be rejected", name);
            }
        }

        #[test]
        fn test_empty_project_and_zone_rejected() {
            let mut spec = sample_spec();
            spec.project = String::new();
            assert!(spec.validate().is_err());

            let mut spec = sample_spec();
            spec.zone = " ".to_string();
            assert!(spec.validate().is_err());
        }

        #[test]
        fn test_identity_rejects_path_characters() {
            let cases = [
                ("p1", "z1/../x"),
                ("p1/x", "z1"),
                ("p1", "US-EAST1"),
                ("p1?a=b", "z1"),
            ];
            for (project, zone) in cases {
                let id = ClusterId::new(project, zone, "c1");
                assert!(
                    matches!(id.validate(), Err(Error::Validation(_))),
                    "expected {}/{} to be rejected",
                    project,
                    zone
                );
            }
        }

        #[test]
        fn test_identity_accepts_domain_scoped_project() {
            assert!(ClusterId::new("example.com:p1", "us-east1-b", "c1").validate().is_ok());
        }
    }

    mod phases {
        use super::*;

        #[test]
        fn test_gke_status_mapping() {
            assert_eq!(Phase::from_gke_status("PROVISIONING"), (Phase::Provisioning, true));
            assert_eq!(Phase::from_gke_status("RUNNING"), (Phase::Running, true));
            assert_eq!(Phase::from_gke_status("RECONCILING"), (Phase::Running, true));
            assert_eq!(Phase::from_gke_status("STOPPING"), (Phase::Deleting, true));
            assert_eq!(Phase::from_gke_status("ERROR"), (Phase::Error, true));
        }

        /// Story: an unknown status never keeps the poller spinning
        #[test]
        fn story_unknown_status_counts_as_running() {
            let (phase, recognised) = Phase::from_gke_status("STATUS_UNSPECIFIED");
            assert!(!recognised);
            assert_eq!(phase, Phase::Running);
        }
    }

    #[test]
    fn test_resource_paths() {
        let id = ClusterId::new("p1", "z1", "c1");
        assert_eq!(id.parent(), "projects/p1/locations/z1");
        assert_eq!(id.resource_name(), "projects/p1/locations/z1/clusters/c1");
        assert!(id.console_url().ends_with("/z1/c1?project=p1"));
    }

    #[test]
    fn test_spec_yaml_defaults() {
        let yaml = r#"
cluster_name: c1
project: p1
zone: z1
instance_type: n1-standard-4
min_instances: 1
max_instances: 3
node_taints:
  - key: dedicated
    value: ml
    effect: NoExecute
"#;
        let spec: ClusterSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.operator_machine_type, "n1-standard-2");
        assert_eq!(spec.cluster_version, "1.17");
        assert!(spec.accelerator_type.is_none());
        assert_eq!(spec.node_taints[0].effect, TaintEffect::NoExecute);
    }

    #[test]
    fn test_provider_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ProviderType::Gcp).unwrap(), "\"gcp\"");
        assert_eq!(ProviderType::Gcp.to_string(), "gcp");
    }
}
