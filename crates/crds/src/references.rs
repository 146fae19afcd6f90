//! Object references and keys shared by the metal CRDs
//!
//! `ResourceReference` follows the Kubernetes `ObjectReference` shape (apiVersion,
//! kind, name, namespace, uid). The allocation core only relies on namespace and name
//! for identity; the uid is carried so a reference can be told apart from a
//! re-created object with the same name.

use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kubernetes-style reference to another object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    /// API version of the referenced object (e.g., "infrastructure.cluster.x-k8s.io/v1alpha3")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the referenced object (e.g., "MetalMachine", "ServerClass")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name of the referenced object
    pub name: String,

    /// Namespace of the referenced object (empty for cluster-scoped kinds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// UID of the referenced object at the time the reference was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ResourceReference {
    /// Create a bare reference by name (cluster-scoped target)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create a full reference to an existing object
    pub fn to_object<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            api_version: Some(K::api_version(&()).into_owned()),
            kind: Some(K::kind(&()).into_owned()),
            name: obj.name_any(),
            namespace: obj.namespace(),
            uid: obj.uid(),
        }
    }

    /// Key (namespace/name) of the referenced object
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.as_deref().unwrap_or_default(), &self.name)
    }

    /// Whether this reference names the object identified by `key`
    pub fn points_to(&self, key: &ObjectKey) -> bool {
        self.name == key.name && self.namespace.as_deref().unwrap_or_default() == key.namespace
    }
}

/// Namespace/name identity of an object. Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Build a key from namespace and name
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone().unwrap_or_default(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}
