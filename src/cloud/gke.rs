//! GKE request and response bodies
//!
//! Only the fields this crate sets or reads are modelled. Field names follow
//! the `container.googleapis.com/v1` REST representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterSpec, ClusterStatus, Phase};

/// Node pool running the Cortex operator
pub const OPERATOR_POOL_NAME: &str = "ng-cortex-operator";

/// Node pool running user workloads
pub const WORKER_POOL_NAME: &str = "ng-cortex-worker-on-demand";

/// Scopes granted to every node
pub const NODE_OAUTH_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/compute",
    "https://www.googleapis.com/auth/devstorage.read_only",
];

const WORKLOAD_LABEL: &str = "workload";
const GPU_LABEL: &str = "nvidia.com/gpu";

/// Body of `POST v1/{parent}/clusters`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRequest {
    /// Cluster to create
    pub cluster: Cluster,
}

/// Cluster resource
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Cluster name
    pub name: String,
    /// Requested Kubernetes version
    pub initial_cluster_version: String,
    /// Node pools created with the cluster
    pub node_pools: Vec<NodePool>,
    /// Zones the nodes run in
    pub locations: Vec<String>,
}

/// Node pool definition
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Pool name
    pub name: String,
    /// Node configuration
    pub config: NodeConfig,
    /// Nodes created up front
    pub initial_node_count: u32,
    /// Autoscaling bounds, absent for fixed-size pools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<NodePoolAutoscaling>,
}

/// Per-node configuration
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Machine type
    pub machine_type: String,
    /// Kubernetes node labels
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Kubernetes node taints
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    /// Accelerators attached to each node
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accelerators: Vec<AcceleratorConfig>,
    /// OAuth scopes
    pub oauth_scopes: Vec<String>,
    /// Service account email; the project default is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

/// Node taint in GKE form
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Taint {
    /// Key
    pub key: String,
    /// Value
    pub value: String,
    /// `NO_SCHEDULE`, `PREFER_NO_SCHEDULE` or `NO_EXECUTE`
    pub effect: String,
}

/// Accelerator attachment
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorConfig {
    /// Accelerators per node
    pub accelerator_count: u32,
    /// Accelerator type, e.g. `nvidia-tesla-t4`
    pub accelerator_type: String,
}

/// Autoscaling bounds of a node pool
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolAutoscaling {
    /// Enable the cluster autoscaler
    pub enabled: bool,
    /// Lower bound
    pub min_node_count: u32,
    /// Upper bound
    pub max_node_count: u32,
}

/// Build the create request for `spec`
///
/// The cluster always gets two pools: a single operator node and an
/// autoscaling worker pool tainted so only workloads land on it.
pub fn create_cluster_request(
    spec: &ClusterSpec,
    service_account: Option<&str>,
) -> CreateClusterRequest {
    let scopes: Vec<String> = NODE_OAUTH_SCOPES.iter().map(|s| s.to_string()).collect();

    let mut labels = spec.node_labels.clone();
    labels.insert(WORKLOAD_LABEL.to_string(), "true".to_string());

    let mut accelerators = Vec::new();
    if let Some(accelerator_type) = &spec.accelerator_type {
        accelerators.push(AcceleratorConfig {
            accelerator_count: 1,
            accelerator_type: accelerator_type.clone(),
        });
        labels.insert(GPU_LABEL.to_string(), "present".to_string());
    }

    let mut taints = vec![Taint {
        key: WORKLOAD_LABEL.to_string(),
        value: "true".to_string(),
        effect: "NO_SCHEDULE".to_string(),
    }];
    taints.extend(spec.node_taints.iter().map(|t| Taint {
        key: t.key.clone(),
        value: t.value.clone(),
        effect: t.effect.as_gke().to_string(),
    }));

    let operator_pool = NodePool {
        name: OPERATOR_POOL_NAME.to_string(),
        config: NodeConfig {
            machine_type: spec.operator_machine_type.clone(),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            accelerators: Vec::new(),
            oauth_scopes: scopes.clone(),
            service_account: service_account.map(str::to_string),
        },
        initial_node_count: 1,
        autoscaling: None,
    };

    let worker_pool = NodePool {
        name: WORKER_POOL_NAME.to_string(),
        config: NodeConfig {
            machine_type: spec.instance_type.clone(),
            labels,
            taints,
            accelerators,
            oauth_scopes: scopes,
            service_account: service_account.map(str::to_string),
        },
        initial_node_count: 1,
        autoscaling: Some(NodePoolAutoscaling {
            enabled: true,
            min_node_count: spec.min_instances,
            max_node_count: spec.max_instances,
        }),
    };

    CreateClusterRequest {
        cluster: Cluster {
            name: spec.cluster_name.clone(),
            initial_cluster_version: spec.cluster_version.clone(),
            node_pools: vec![operator_pool, worker_pool],
            locations: vec![spec.zone.clone()],
        },
    }
}

/// Subset of the cluster resource returned by `GET v1/{name}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResponse {
    /// Raw status enum, e.g. `PROVISIONING`
    #[serde(default)]
    pub status: String,
    /// Human-readable diagnostic
    #[serde(default)]
    pub status_message: String,
}

impl ClusterResponse {
    /// Convert into the closed phase set, reporting whether the status was known
    pub fn into_status(self) -> (ClusterStatus, bool) {
        let (phase, recognised) = Phase::from_gke_status(&self.status);
        (ClusterStatus::with_message(phase, self.status_message), recognised)
    }
}
