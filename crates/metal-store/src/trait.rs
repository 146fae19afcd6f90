//! MetalStore trait for mocking
//!
//! This trait abstracts resource access so the allocation logic can run against the
//! Kubernetes API in production and an in-memory store in unit tests.
//!
//! Semantics every implementation must honour:
//! - `create_*` fails with `StoreError::AlreadyExists` when the identity is taken
//! - `update_metal_machine` fails with `StoreError::Conflict` when the resource version
//!   carried by the object is stale
//! - `delete_server_binding` treats a missing binding as success
//! - status writes go through the status subresource and leave spec untouched

use crate::error::StoreError;
use crds::{
    Cluster, Machine, MetalMachine, MetalMachineStatus, ObjectKey, Server, ServerBinding,
    ServerBindingStatus, ServerClass, ServerClassSpec, ServerClassStatus,
};

/// Trait for metal resource operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait MetalStore: Send + Sync {
    // Servers
    async fn get_server(&self, name: &str) -> Result<Server, StoreError>;
    async fn list_servers(&self) -> Result<Vec<Server>, StoreError>;

    // ServerClasses
    async fn get_server_class(&self, name: &str) -> Result<ServerClass, StoreError>;
    async fn list_server_classes(&self) -> Result<Vec<ServerClass>, StoreError>;
    async fn create_server_class(&self, class: &ServerClass) -> Result<ServerClass, StoreError>;
    async fn update_server_class_spec(&self, name: &str, spec: &ServerClassSpec) -> Result<(), StoreError>;
    async fn update_server_class_status(&self, name: &str, status: &ServerClassStatus) -> Result<(), StoreError>;

    // ServerBindings
    async fn get_server_binding(&self, name: &str) -> Result<ServerBinding, StoreError>;
    async fn list_server_bindings(&self) -> Result<Vec<ServerBinding>, StoreError>;
    async fn create_server_binding(&self, binding: &ServerBinding) -> Result<ServerBinding, StoreError>;
    async fn delete_server_binding(&self, name: &str) -> Result<(), StoreError>;
    async fn update_server_binding_status(&self, name: &str, status: &ServerBindingStatus) -> Result<(), StoreError>;

    // MetalMachines
    async fn get_metal_machine(&self, key: &ObjectKey) -> Result<MetalMachine, StoreError>;
    async fn list_metal_machines(&self) -> Result<Vec<MetalMachine>, StoreError>;
    /// Write finalizers and spec, guarded by the object's resource version
    async fn update_metal_machine(&self, machine: &MetalMachine) -> Result<MetalMachine, StoreError>;
    async fn update_metal_machine_status(&self, key: &ObjectKey, status: &MetalMachineStatus) -> Result<(), StoreError>;

    // Cluster API owners (read-only)
    async fn get_machine(&self, key: &ObjectKey) -> Result<Machine, StoreError>;
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Cluster, StoreError>;

    /// Bindings whose machine reference points at `machine`
    async fn list_server_bindings_for_machine(&self, machine: &ObjectKey) -> Result<Vec<ServerBinding>, StoreError> {
        Ok(self
            .list_server_bindings()
            .await?
            .into_iter()
            .filter(|b| b.spec.metal_machine_ref.points_to(machine))
            .collect())
    }

    /// MetalMachines whose server reference names `server`
    async fn list_metal_machines_for_server(&self, server: &str) -> Result<Vec<MetalMachine>, StoreError> {
        Ok(self
            .list_metal_machines()
            .await?
            .into_iter()
            .filter(|m| m.spec.server_ref.as_ref().is_some_and(|r| r.name == server))
            .collect())
    }
}
