//! Kubernetes-backed MetalStore
//!
//! Cluster-scoped kinds (Server, ServerClass, ServerBinding) go through `Api::all`;
//! MetalMachines and the Cluster API owners are namespaced. Writes are JSON merge
//! patches that spell out every owned field, so clearing a field sends an explicit
//! `null` or empty list instead of being dropped.

use crate::error::StoreError;
use crate::metal_trait::MetalStore;
use crds::{
    Cluster, Machine, MetalMachine, MetalMachineStatus, ObjectKey, Server, ServerBinding,
    ServerBindingStatus, ServerClass, ServerClassSpec, ServerClassStatus,
};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::debug;

/// MetalStore backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: Option<String>,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Create a store. `namespace` restricts MetalMachine listing; `None` watches all.
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn servers(&self) -> Api<Server> {
        Api::all(self.client.clone())
    }

    fn server_classes(&self) -> Api<ServerClass> {
        Api::all(self.client.clone())
    }

    fn server_bindings(&self) -> Api<ServerBinding> {
        Api::all(self.client.clone())
    }

    fn metal_machines_in(&self, namespace: &str) -> Api<MetalMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn metal_machines(&self) -> Api<MetalMachine> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl MetalStore for KubeStore {
    async fn get_server(&self, name: &str) -> Result<Server, StoreError> {
        self.servers()
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("Server {name}")))
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        Ok(self.servers().list(&ListParams::default()).await?.items)
    }

    async fn get_server_class(&self, name: &str) -> Result<ServerClass, StoreError> {
        self.server_classes()
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("ServerClass {name}")))
    }

    async fn list_server_classes(&self) -> Result<Vec<ServerClass>, StoreError> {
        Ok(self.server_classes().list(&ListParams::default()).await?.items)
    }

    async fn create_server_class(&self, class: &ServerClass) -> Result<ServerClass, StoreError> {
        let name = class.metadata.name.clone().unwrap_or_default();
        self.server_classes()
            .create(&PostParams::default(), class)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("ServerClass {name}")))
    }

    async fn update_server_class_spec(&self, name: &str, spec: &ServerClassSpec) -> Result<(), StoreError> {
        let patch = json!({
            "spec": {
                "selector": spec.selector,
                "qualifiers": {
                    "cpu": spec.qualifiers.cpu,
                    "systemInformation": spec.qualifiers.system_information,
                    "labelSelectors": spec.qualifiers.label_selectors,
                },
                "environmentRef": spec.environment_ref,
            }
        });
        self.server_classes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, format!("ServerClass {name}")))?;
        Ok(())
    }

    async fn update_server_class_status(&self, name: &str, status: &ServerClassStatus) -> Result<(), StoreError> {
        let patch = json!({ "status": status });
        self.server_classes()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, format!("ServerClass {name}")))?;
        Ok(())
    }

    async fn get_server_binding(&self, name: &str) -> Result<ServerBinding, StoreError> {
        self.server_bindings()
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("ServerBinding {name}")))
    }

    async fn list_server_bindings(&self) -> Result<Vec<ServerBinding>, StoreError> {
        Ok(self.server_bindings().list(&ListParams::default()).await?.items)
    }

    async fn create_server_binding(&self, binding: &ServerBinding) -> Result<ServerBinding, StoreError> {
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.server_bindings()
            .create(&PostParams::default(), binding)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("ServerBinding {name}")))
    }

    async fn delete_server_binding(&self, name: &str) -> Result<(), StoreError> {
        match self.server_bindings().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match StoreError::from_kube(e, format!("ServerBinding {name}")) {
                StoreError::NotFound(_) => {
                    debug!("ServerBinding {} already gone", name);
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn update_server_binding_status(&self, name: &str, status: &ServerBindingStatus) -> Result<(), StoreError> {
        let patch = json!({
            "status": {
                "ready": status.ready,
                "conditions": status.conditions,
            }
        });
        self.server_bindings()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, format!("ServerBinding {name}")))?;
        Ok(())
    }

    async fn get_metal_machine(&self, key: &ObjectKey) -> Result<MetalMachine, StoreError> {
        self.metal_machines_in(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("MetalMachine {key}")))
    }

    async fn list_metal_machines(&self) -> Result<Vec<MetalMachine>, StoreError> {
        Ok(self.metal_machines().list(&ListParams::default()).await?.items)
    }

    async fn update_metal_machine(&self, machine: &MetalMachine) -> Result<MetalMachine, StoreError> {
        let key = ObjectKey::of(machine);
        let patch = json!({
            "metadata": {
                "finalizers": machine.metadata.finalizers.clone().unwrap_or_default(),
                "resourceVersion": machine.metadata.resource_version,
            },
            "spec": {
                "providerID": machine.spec.provider_id,
                "serverRef": machine.spec.server_ref,
                "serverClassRef": machine.spec.server_class_ref,
            }
        });
        self.metal_machines_in(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, format!("MetalMachine {key}")))
    }

    async fn update_metal_machine_status(&self, key: &ObjectKey, status: &MetalMachineStatus) -> Result<(), StoreError> {
        let patch = json!({
            "status": {
                "ready": status.ready,
                "addresses": status.addresses,
                "conditions": status.conditions,
                "failureReason": status.failure_reason,
                "failureMessage": status.failure_message,
            }
        });
        self.metal_machines_in(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, format!("MetalMachine {key}")))?;
        Ok(())
    }

    async fn get_machine(&self, key: &ObjectKey) -> Result<Machine, StoreError> {
        Api::<Machine>::namespaced(self.client.clone(), &key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("Machine {key}")))
    }

    async fn get_cluster(&self, key: &ObjectKey) -> Result<Cluster, StoreError> {
        Api::<Cluster>::namespaced(self.client.clone(), &key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("Cluster {key}")))
    }
}
