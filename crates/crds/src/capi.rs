//! Read-only Cluster API accessors
//!
//! Only the fields the allocator reads from the owning `Machine` and its `Cluster`
//! are modeled. Unknown fields are dropped on deserialization and these types are
//! never written back.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label on Cluster API objects naming their cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// API group of Cluster API core types
pub const CLUSTER_API_GROUP: &str = "cluster.x-k8s.io";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Cluster this machine belongs to
    #[serde(default)]
    pub cluster_name: String,

    /// Bootstrap configuration
    #[serde(default)]
    pub bootstrap: Bootstrap,
}

/// Machine bootstrap reference
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Secret holding the rendered bootstrap data, set once it is available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Reconciliation of the cluster's objects is suspended
    #[serde(default)]
    pub paused: bool,
}

/// Cluster status fields read by the allocator
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Cluster infrastructure is provisioned
    #[serde(default)]
    pub infrastructure_ready: bool,
}

impl Machine {
    /// Cluster name from the well-known label, falling back to `spec.clusterName`
    pub fn cluster_name(&self) -> Option<String> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CLUSTER_NAME_LABEL).cloned())
            .or_else(|| (!self.spec.cluster_name.is_empty()).then(|| self.spec.cluster_name.clone()))
    }

    /// Bootstrap data secret, if rendered yet
    pub fn bootstrap_data_secret(&self) -> Option<&str> {
        self.spec.bootstrap.data_secret_name.as_deref()
    }
}

impl Cluster {
    /// Infrastructure provisioned
    pub fn infrastructure_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.infrastructure_ready)
    }
}
