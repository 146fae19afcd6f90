//! ServerClass CRD
//!
//! A named, declarative filter over servers. Its status materializes the servers
//! currently qualifying for it, split by whether they are in use.

use crate::references::ResourceReference;
use crate::server::{CPUInformation, SystemInformation};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the built-in class that matches every accepted server
pub const SERVER_CLASS_ANY: &str = "any";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "metal.dcops.microscaler.io",
    version = "v1alpha1",
    kind = "ServerClass",
    status = "ServerClassStatus",
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.serversAvailable"}"#,
    printcolumn = r#"{"name":"In Use","type":"string","jsonPath":".status.serversInUse"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServerClassSpec {
    /// Label selector applied to server labels before the qualifiers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Hardware and label qualifiers
    #[serde(default)]
    pub qualifiers: Qualifiers,

    /// Boot environment for servers allocated through this class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_ref: Option<ResourceReference>,
}

/// Qualifiers a server must pass to belong to a class.
///
/// Each non-empty list is an OR over its entries; the lists themselves are ANDed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Qualifiers {
    /// CPU criteria; empty fields are wildcards
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu: Vec<CPUInformation>,

    /// System information criteria; empty fields are wildcards
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_information: Vec<SystemInformation>,

    /// Label maps; a server qualifies when any single key/value pair matches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_selectors: Vec<BTreeMap<String, String>>,
}

impl Qualifiers {
    /// No qualifiers at all
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.system_information.is_empty() && self.label_selectors.is_empty()
    }
}

/// Kubernetes label selector
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Exact label matches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Set-based requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// A set-based label requirement
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// Label key
    pub key: String,

    /// One of In, NotIn, Exists, DoesNotExist
    pub operator: String,

    /// Values for In / NotIn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerClassStatus {
    /// Qualifying servers that are free
    #[serde(default)]
    pub servers_available: Vec<String>,

    /// Qualifying servers that are claimed
    #[serde(default)]
    pub servers_in_use: Vec<String>,
}

impl ServerClass {
    /// The class's available pool, empty when status was never written
    pub fn available_servers(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.servers_available.as_slice())
            .unwrap_or_default()
    }
}
