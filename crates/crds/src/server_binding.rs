//! ServerBinding CRD
//!
//! The durable record that a server is claimed by a MetalMachine. Its name is the
//! server's identity, so at most one binding can exist per server: the API server's
//! create-if-absent is the claim arbiter.

use crate::conditions::Condition;
use crate::references::ResourceReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "ServerBinding",
    status = "ServerBindingStatus",
    printcolumn = r#"{"name":"Machine","type":"string","jsonPath":".spec.metalMachineRef.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServerBindingSpec {
    /// MetalMachine holding the claim
    pub metal_machine_ref: ResourceReference,

    /// ServerClass the server was picked from (absent for direct assignment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_class_ref: Option<ResourceReference>,

    /// Node addresses reported for the bound server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    /// Hostname reported for the bound server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerBindingStatus {
    /// The bound server exists
    #[serde(default)]
    pub ready: bool,

    /// Conditions propagated to the owning MetalMachine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ServerBinding {
    /// Whether the binding has been confirmed ready
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ready)
    }
}
