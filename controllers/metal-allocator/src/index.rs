//! Reverse lookup index
//!
//! Two relations the reconcilers need answered without a full list:
//! - MetalMachine -> ServerBindings whose `metalMachineRef` points at it
//! - Server -> MetalMachines whose `serverRef` names it
//!
//! The index is a cache: it is rebuilt from a full list at startup and at every
//! watch (re)initialisation, and kept live from watch events in between. A miss is
//! never proof of absence; callers fall back to the store.

use crds::{MetalMachine, ObjectKey, Server, ServerBinding};
use kube::ResourceExt;
use kube_runtime::reflector::ObjectRef;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
struct IndexState {
    // binding name -> machine it references
    binding_machine: HashMap<String, ObjectKey>,
    bindings_by_machine: HashMap<ObjectKey, BTreeSet<String>>,
    // machine -> server it references
    machine_server: HashMap<ObjectKey, String>,
    machines_by_server: HashMap<String, BTreeSet<ObjectKey>>,
}

impl IndexState {
    fn unlink_binding(&mut self, name: &str) {
        if let Some(machine) = self.binding_machine.remove(name) {
            if let Some(names) = self.bindings_by_machine.get_mut(&machine) {
                names.remove(name);
                if names.is_empty() {
                    self.bindings_by_machine.remove(&machine);
                }
            }
        }
    }

    fn link_binding(&mut self, binding: &ServerBinding) {
        let name = binding.name_any();
        self.unlink_binding(&name);
        let machine = binding.spec.metal_machine_ref.key();
        self.bindings_by_machine
            .entry(machine.clone())
            .or_default()
            .insert(name.clone());
        self.binding_machine.insert(name, machine);
    }

    fn unlink_machine(&mut self, key: &ObjectKey) {
        if let Some(server) = self.machine_server.remove(key) {
            if let Some(keys) = self.machines_by_server.get_mut(&server) {
                keys.remove(key);
                if keys.is_empty() {
                    self.machines_by_server.remove(&server);
                }
            }
        }
    }

    fn link_machine(&mut self, machine: &MetalMachine) {
        let key = ObjectKey::of(machine);
        self.unlink_machine(&key);
        if let Some(server_ref) = &machine.spec.server_ref {
            self.machines_by_server
                .entry(server_ref.name.clone())
                .or_default()
                .insert(key.clone());
            self.machine_server.insert(key, server_ref.name.clone());
        }
    }
}

/// Shared, cloneable reverse index.
#[derive(Debug, Clone, Default)]
pub struct ReverseIndex {
    state: Arc<RwLock<IndexState>>,
}

impl ReverseIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a created or updated binding
    pub fn apply_binding(&self, binding: &ServerBinding) {
        self.write().link_binding(binding);
    }

    /// Forget a deleted binding
    pub fn remove_binding(&self, name: &str) {
        self.write().unlink_binding(name);
    }

    /// Record a created or updated MetalMachine
    pub fn apply_machine(&self, machine: &MetalMachine) {
        self.write().link_machine(machine);
    }

    /// Forget a deleted MetalMachine
    pub fn remove_machine(&self, key: &ObjectKey) {
        self.write().unlink_machine(key);
    }

    /// Rebuild the binding relation from a full list
    pub fn replace_bindings<'a>(&self, bindings: impl IntoIterator<Item = &'a ServerBinding>) {
        let mut state = self.write();
        state.binding_machine.clear();
        state.bindings_by_machine.clear();
        for binding in bindings {
            state.link_binding(binding);
        }
    }

    /// Rebuild the machine relation from a full list
    pub fn replace_machines<'a>(&self, machines: impl IntoIterator<Item = &'a MetalMachine>) {
        let mut state = self.write();
        state.machine_server.clear();
        state.machines_by_server.clear();
        for machine in machines {
            state.link_machine(machine);
        }
    }

    /// Names of bindings referencing `machine`, sorted
    pub fn bindings_for_machine(&self, machine: &ObjectKey) -> Vec<String> {
        self.read()
            .bindings_by_machine
            .get(machine)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// MetalMachines referencing `server`, sorted
    pub fn machines_for_server(&self, server: &str) -> Vec<ObjectKey> {
        self.read()
            .machines_by_server
            .get(server)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Watch mapper: binding change -> MetalMachine to reconcile
pub fn machine_for_binding(binding: &ServerBinding) -> Option<ObjectRef<MetalMachine>> {
    let reference = &binding.spec.metal_machine_ref;
    let namespace = reference.namespace.as_deref()?;
    Some(ObjectRef::new(&reference.name).within(namespace))
}

/// Watch mapper: MetalMachine change -> Server whose binding may need healing
pub fn server_for_machine(machine: &MetalMachine) -> Option<ObjectRef<Server>> {
    machine
        .spec
        .server_ref
        .as_ref()
        .map(|server_ref| ObjectRef::new(&server_ref.name))
}

/// Watch mapper: Server change -> binding named after it
pub fn binding_for_server(server: &Server) -> ObjectRef<ServerBinding> {
    ObjectRef::new(&server.name_any())
}

/// Watch mapper: binding change -> Server it claims
pub fn server_for_binding(binding: &ServerBinding) -> ObjectRef<Server> {
    ObjectRef::new(&binding.name_any())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_binding_relation_follows_updates() {
        let index = ReverseIndex::new();
        let m1 = ObjectKey::new("default", "m1");
        let m2 = ObjectKey::new("default", "m2");

        index.apply_binding(&create_test_binding("srv-a", "default", "m1"));
        index.apply_binding(&create_test_binding("srv-b", "default", "m1"));
        assert_eq!(index.bindings_for_machine(&m1), vec!["srv-a", "srv-b"]);

        // Re-pointing a binding moves it between machines
        index.apply_binding(&create_test_binding("srv-b", "default", "m2"));
        assert_eq!(index.bindings_for_machine(&m1), vec!["srv-a"]);
        assert_eq!(index.bindings_for_machine(&m2), vec!["srv-b"]);

        index.remove_binding("srv-a");
        assert!(index.bindings_for_machine(&m1).is_empty());
    }

    #[test]
    fn test_machine_relation_follows_server_ref() {
        let index = ReverseIndex::new();
        let mut machine = create_test_metal_machine("default", "m1", Some("large"));
        index.apply_machine(&machine);
        assert!(index.machines_for_server("srv-a").is_empty());

        machine.spec.server_ref = Some(crds::ResourceReference::new("srv-a"));
        index.apply_machine(&machine);
        assert_eq!(index.machines_for_server("srv-a"), vec![ObjectKey::new("default", "m1")]);

        index.remove_machine(&ObjectKey::new("default", "m1"));
        assert!(index.machines_for_server("srv-a").is_empty());
    }

    #[test]
    fn test_replace_drops_stale_entries() {
        let index = ReverseIndex::new();
        index.apply_binding(&create_test_binding("srv-gone", "default", "m1"));

        let fresh = [create_test_binding("srv-a", "default", "m2")];
        index.replace_bindings(fresh.iter());

        assert!(index.bindings_for_machine(&ObjectKey::new("default", "m1")).is_empty());
        assert_eq!(index.bindings_for_machine(&ObjectKey::new("default", "m2")), vec!["srv-a"]);
    }

    #[test]
    fn test_machine_for_binding_mapper() {
        let binding = create_test_binding("srv-a", "clusters", "worker-0");
        let target = machine_for_binding(&binding).unwrap();
        assert_eq!(target.name, "worker-0");
        assert_eq!(target.namespace.as_deref(), Some("clusters"));
    }
}
