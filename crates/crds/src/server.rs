//! Server CRD
//!
//! A physical machine registered with the inventory. The name is the machine's
//! unique hardware identity (SMBIOS UUID).

use crate::references::ResourceReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label set on workload nodes carrying the server UUID they run on
pub const SERVER_UUID_LABEL: &str = "metal.dcops.microscaler.io/uuid";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "metal.dcops.microscaler.io",
    version = "v1alpha1",
    kind = "Server",
    status = "ServerStatus",
    printcolumn = r#"{"name":"Accepted","type":"boolean","jsonPath":".spec.accepted"}"#,
    printcolumn = r#"{"name":"In Use","type":"boolean","jsonPath":".status.inUse"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Operator approval; servers that are not accepted are never allocated
    #[serde(default)]
    pub accepted: bool,

    /// Cordoned servers are excluded from new allocations
    #[serde(default)]
    pub cordoned: bool,

    /// Processor information reported by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CPUInformation>,

    /// System (SMBIOS) information reported by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_information: Option<SystemInformation>,

    /// Hostname reported by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Boot environment override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_ref: Option<ResourceReference>,
}

/// Processor information
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CPUInformation {
    /// CPU manufacturer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manufacturer: String,

    /// CPU version / model string
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// System (SMBIOS) information
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemInformation {
    /// System manufacturer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manufacturer: String,

    /// Product name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product_name: String,

    /// Product version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Serial number
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,

    /// SKU number
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sku_number: String,

    /// Product family
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family: String,
}

/// Observed server state, maintained by the inventory side.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Server is powered and reachable
    #[serde(default)]
    pub ready: bool,

    /// Server is currently claimed by a workload
    #[serde(default)]
    pub in_use: bool,

    /// Server has been wiped since its last use
    #[serde(default)]
    pub is_clean: bool,
}

impl Server {
    /// Accepted by the operator
    pub fn is_accepted(&self) -> bool {
        self.spec.accepted
    }

    /// Claimed by a workload according to the inventory
    pub fn is_in_use(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.in_use)
    }

    /// Wiped since last use according to the inventory
    pub fn is_clean(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_clean)
    }
}
