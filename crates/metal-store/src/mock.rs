//! Mock MetalStore for unit testing
//!
//! This module provides in-memory implementations of `MetalStore` and
//! `WorkloadClusterClient` that can be used in unit tests without a running API server.
//! The store reproduces the API server behaviour the allocator depends on: identity
//! collisions on create, resource-version conflicts on spec writes, idempotent
//! binding deletion, and finalizer-gated removal of deleting MetalMachines.

use crate::error::StoreError;
use crate::metal_trait::MetalStore;
use crate::workload::WorkloadClusterClient;
use crds::{
    Cluster, Machine, MetalMachine, MetalMachineStatus, ObjectKey, Server, ServerBinding,
    ServerBindingStatus, ServerClass, ServerClassSpec, ServerClassStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock MetalStore for testing
///
/// Clones share state, so a test can hand one clone to the code under test and keep
/// another for setup and assertions.
#[derive(Clone, Default)]
pub struct MockMetalStore {
    servers: Arc<Mutex<BTreeMap<String, Server>>>,
    server_classes: Arc<Mutex<BTreeMap<String, ServerClass>>>,
    server_bindings: Arc<Mutex<BTreeMap<String, ServerBinding>>>,
    metal_machines: Arc<Mutex<BTreeMap<ObjectKey, MetalMachine>>>,
    machines: Arc<Mutex<BTreeMap<ObjectKey, Machine>>>,
    clusters: Arc<Mutex<BTreeMap<ObjectKey, Cluster>>>,
    // Counter for generating resource versions
    next_version: Arc<Mutex<u64>>,
    // Failure injection for binding creates
    binding_create_failure: Arc<Mutex<Option<String>>>,
    binding_creates: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for MockMetalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMetalStore").finish_non_exhaustive()
    }
}

impl MockMetalStore {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        let mut version = lock(&self.next_version);
        *version += 1;
        version.to_string()
    }

    /// Add a server (for test setup)
    pub fn add_server(&self, mut server: Server) {
        server.metadata.resource_version = Some(self.next_version());
        lock(&self.servers).insert(server.metadata.name.clone().unwrap_or_default(), server);
    }

    /// Remove a server (for test setup)
    pub fn remove_server(&self, name: &str) {
        lock(&self.servers).remove(name);
    }

    /// Add a server class (for test setup)
    pub fn add_server_class(&self, mut class: ServerClass) {
        class.metadata.resource_version = Some(self.next_version());
        lock(&self.server_classes).insert(class.metadata.name.clone().unwrap_or_default(), class);
    }

    /// Add a binding without going through create (for test setup)
    pub fn add_server_binding(&self, mut binding: ServerBinding) {
        binding.metadata.resource_version = Some(self.next_version());
        lock(&self.server_bindings).insert(binding.metadata.name.clone().unwrap_or_default(), binding);
    }

    /// Add a MetalMachine (for test setup)
    pub fn add_metal_machine(&self, mut machine: MetalMachine) {
        machine.metadata.resource_version = Some(self.next_version());
        if machine.metadata.uid.is_none() {
            machine.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        lock(&self.metal_machines).insert(ObjectKey::of(&machine), machine);
    }

    /// Add a Cluster API Machine (for test setup)
    pub fn add_machine(&self, machine: Machine) {
        lock(&self.machines).insert(ObjectKey::of(&machine), machine);
    }

    /// Add a Cluster API Cluster (for test setup)
    pub fn add_cluster(&self, cluster: Cluster) {
        lock(&self.clusters).insert(ObjectKey::of(&cluster), cluster);
    }

    /// Make every subsequent binding create fail with `InvalidRequest(message)`
    pub fn fail_binding_creates(&self, message: impl Into<String>) {
        *lock(&self.binding_create_failure) = Some(message.into());
    }

    /// Snapshot of all bindings
    pub fn server_bindings(&self) -> Vec<ServerBinding> {
        lock(&self.server_bindings).values().cloned().collect()
    }

    /// Number of successful binding creates
    pub fn binding_creates(&self) -> u64 {
        *lock(&self.binding_creates)
    }

    /// Current state of a MetalMachine, `None` once it has been removed
    pub fn metal_machine(&self, key: &ObjectKey) -> Option<MetalMachine> {
        lock(&self.metal_machines).get(key).cloned()
    }

    /// Current state of a server class
    pub fn server_class(&self, name: &str) -> Option<ServerClass> {
        lock(&self.server_classes).get(name).cloned()
    }
}

#[async_trait::async_trait]
impl MetalStore for MockMetalStore {
    async fn get_server(&self, name: &str) -> Result<Server, StoreError> {
        lock(&self.servers)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Server {name}")))
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        Ok(lock(&self.servers).values().cloned().collect())
    }

    async fn get_server_class(&self, name: &str) -> Result<ServerClass, StoreError> {
        lock(&self.server_classes)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ServerClass {name}")))
    }

    async fn list_server_classes(&self) -> Result<Vec<ServerClass>, StoreError> {
        Ok(lock(&self.server_classes).values().cloned().collect())
    }

    async fn create_server_class(&self, class: &ServerClass) -> Result<ServerClass, StoreError> {
        let name = class.metadata.name.clone().unwrap_or_default();
        let mut classes = lock(&self.server_classes);
        if classes.contains_key(&name) {
            return Err(StoreError::AlreadyExists(format!("ServerClass {name}")));
        }
        let mut created = class.clone();
        created.metadata.resource_version = Some(self.next_version());
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        classes.insert(name, created.clone());
        Ok(created)
    }

    async fn update_server_class_spec(&self, name: &str, spec: &ServerClassSpec) -> Result<(), StoreError> {
        let mut classes = lock(&self.server_classes);
        let class = classes
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("ServerClass {name}")))?;
        class.spec = spec.clone();
        class.metadata.resource_version = Some(self.next_version());
        Ok(())
    }

    async fn update_server_class_status(&self, name: &str, status: &ServerClassStatus) -> Result<(), StoreError> {
        let mut classes = lock(&self.server_classes);
        let class = classes
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("ServerClass {name}")))?;
        class.status = Some(status.clone());
        class.metadata.resource_version = Some(self.next_version());
        Ok(())
    }

    async fn get_server_binding(&self, name: &str) -> Result<ServerBinding, StoreError> {
        lock(&self.server_bindings)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ServerBinding {name}")))
    }

    async fn list_server_bindings(&self) -> Result<Vec<ServerBinding>, StoreError> {
        Ok(self.server_bindings())
    }

    async fn create_server_binding(&self, binding: &ServerBinding) -> Result<ServerBinding, StoreError> {
        if let Some(message) = lock(&self.binding_create_failure).clone() {
            return Err(StoreError::InvalidRequest(message));
        }
        let name = binding.metadata.name.clone().unwrap_or_default();
        let mut bindings = lock(&self.server_bindings);
        if bindings.contains_key(&name) {
            return Err(StoreError::AlreadyExists(format!("ServerBinding {name}")));
        }
        let mut created = binding.clone();
        created.metadata.resource_version = Some(self.next_version());
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        bindings.insert(name, created.clone());
        *lock(&self.binding_creates) += 1;
        Ok(created)
    }

    async fn delete_server_binding(&self, name: &str) -> Result<(), StoreError> {
        lock(&self.server_bindings).remove(name);
        Ok(())
    }

    async fn update_server_binding_status(&self, name: &str, status: &ServerBindingStatus) -> Result<(), StoreError> {
        let mut bindings = lock(&self.server_bindings);
        let binding = bindings
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("ServerBinding {name}")))?;
        binding.status = Some(status.clone());
        binding.metadata.resource_version = Some(self.next_version());
        Ok(())
    }

    async fn get_metal_machine(&self, key: &ObjectKey) -> Result<MetalMachine, StoreError> {
        lock(&self.metal_machines)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("MetalMachine {key}")))
    }

    async fn list_metal_machines(&self) -> Result<Vec<MetalMachine>, StoreError> {
        Ok(lock(&self.metal_machines).values().cloned().collect())
    }

    async fn update_metal_machine(&self, machine: &MetalMachine) -> Result<MetalMachine, StoreError> {
        let key = ObjectKey::of(machine);
        let mut machines = lock(&self.metal_machines);
        let stored = machines
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("MetalMachine {key}")))?;

        if let Some(expected) = machine.metadata.resource_version.as_ref() {
            if stored.metadata.resource_version.as_ref() != Some(expected) {
                return Err(StoreError::Conflict(format!("MetalMachine {key}")));
            }
        }

        stored.metadata.finalizers = machine.metadata.finalizers.clone();
        stored.spec = machine.spec.clone();
        stored.metadata.resource_version = Some(self.next_version());
        let updated = stored.clone();

        let released = updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if released {
            machines.remove(&key);
        }
        Ok(updated)
    }

    async fn update_metal_machine_status(&self, key: &ObjectKey, status: &MetalMachineStatus) -> Result<(), StoreError> {
        let mut machines = lock(&self.metal_machines);
        let stored = machines
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("MetalMachine {key}")))?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(self.next_version());
        Ok(())
    }

    async fn get_machine(&self, key: &ObjectKey) -> Result<Machine, StoreError> {
        lock(&self.machines)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Machine {key}")))
    }

    async fn get_cluster(&self, key: &ObjectKey) -> Result<Cluster, StoreError> {
        lock(&self.clusters)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Cluster {key}")))
    }
}

/// Mock workload cluster: a set of nodes keyed by server UUID.
#[derive(Clone, Default)]
pub struct MockWorkloadClient {
    // server uuid -> provider IDs of nodes carrying that uuid label
    nodes: Arc<Mutex<HashMap<String, Vec<Option<String>>>>>,
}

impl std::fmt::Debug for MockWorkloadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockWorkloadClient").finish_non_exhaustive()
    }
}

impl MockWorkloadClient {
    /// Create a workload cluster without nodes
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node labelled with `server_uuid` (for test setup)
    pub fn add_node(&self, server_uuid: &str) {
        lock(&self.nodes).entry(server_uuid.to_string()).or_default().push(None);
    }

    /// Provider ID of the first node labelled with `server_uuid`
    pub fn provider_id(&self, server_uuid: &str) -> Option<String> {
        lock(&self.nodes)
            .get(server_uuid)
            .and_then(|nodes| nodes.first().cloned().flatten())
    }
}

#[async_trait::async_trait]
impl WorkloadClusterClient for MockWorkloadClient {
    async fn set_node_provider_id(
        &self,
        _cluster: &ObjectKey,
        server_uuid: &str,
        provider_id: &str,
    ) -> Result<(), StoreError> {
        let mut nodes = lock(&self.nodes);
        match nodes.get_mut(server_uuid).map(Vec::as_mut_slice) {
            Some([node]) => {
                *node = Some(provider_id.to_string());
                Ok(())
            }
            Some([_, _, ..]) => Err(StoreError::InvalidRequest(format!(
                "multiple nodes found for {server_uuid}"
            ))),
            _ => Err(StoreError::InvalidRequest(format!(
                "no matching nodes found for {server_uuid}"
            ))),
        }
    }
}
