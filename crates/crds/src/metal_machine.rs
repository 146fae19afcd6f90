//! MetalMachine CRD
//!
//! The infrastructure request made on behalf of a Cluster API `Machine`. It either
//! names a server directly or names a ServerClass to allocate from.

use crate::conditions::Condition;
use crate::references::ResourceReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer holding a MetalMachine until its binding is released
pub const METAL_MACHINE_FINALIZER: &str = "metalmachine.infrastructure.cluster.x-k8s.io";

/// Scheme of provider IDs written to `spec.providerID` and workload nodes
pub const PROVIDER_ID_SCHEME: &str = "metal";

/// Failure reason recorded when neither a server nor a class is referenced
pub const INVALID_CONFIGURATION_REASON: &str = "InvalidConfiguration";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "MetalMachine",
    namespaced,
    status = "MetalMachineStatus",
    printcolumn = r#"{"name":"Server","type":"string","jsonPath":".spec.serverRef.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineSpec {
    /// Provider ID, `metal://<server uuid>`, once allocated
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Server bound to this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ref: Option<ResourceReference>,

    /// Class to allocate a server from when no server is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_class_ref: Option<ResourceReference>,
}

/// Address of the machine as reported to Cluster API
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    /// Address type (InternalIP, Hostname, ...)
    #[serde(rename = "type")]
    pub type_: MachineAddressType,

    /// The address
    pub address: String,
}

/// Machine address kinds used by this provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    /// Hostname
    Hostname,
    /// Internal IP
    #[serde(rename = "InternalIP")]
    InternalIp,
    /// External IP
    #[serde(rename = "ExternalIP")]
    ExternalIp,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineStatus {
    /// Infrastructure is ready for the workload
    #[serde(default)]
    pub ready: bool,

    /// Addresses copied from the bound server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Conditions, including those propagated from the binding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Terminal failure reason, set for configuration errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Terminal failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl MetalMachine {
    /// Provider ID for a server identity
    pub fn provider_id_for(server_name: &str) -> String {
        format!("{PROVIDER_ID_SCHEME}://{server_name}")
    }

    /// Marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the allocation finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|name| name == METAL_MACHINE_FINALIZER))
    }

    /// Add the allocation finalizer if missing
    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(METAL_MACHINE_FINALIZER.to_string());
        }
    }

    /// Remove the allocation finalizer
    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|name| name != METAL_MACHINE_FINALIZER);
        }
    }

    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut MetalMachineStatus {
        self.status.get_or_insert_with(MetalMachineStatus::default)
    }
}
