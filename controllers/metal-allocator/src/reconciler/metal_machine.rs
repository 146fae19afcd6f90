//! MetalMachine reconciler
//!
//! Claims a server for a MetalMachine, reports it ready once its binding is ready,
//! stamps the provider ID onto the workload node, and releases the claim on delete.
//!
//! The claim itself is the creation of a `ServerBinding` named after the server.
//! Two allocators racing for the same server both attempt that create; the API
//! server accepts one and rejects the other with already-exists, and the loser moves
//! on to its next candidate.

use super::{ReconcileOutcome, Reconciler, WaitReason};
use crate::error::ControllerError;
use crate::patch::PatchScope;
use crate::qualification::filter_accepted_servers;
use crds::conditions::{self, PROVIDER_SET_CONDITION, PROVIDER_UPDATE_FAILED_REASON};
use crds::conversion::{binding_from_legacy_assignment, new_binding, LegacyAssignment};
use crds::{
    ConditionSeverity, MachineAddress, MachineAddressType, MetalMachine, ObjectKey,
    ResourceReference, ServerBinding, CLUSTER_API_GROUP, INVALID_CONFIGURATION_REASON,
};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

/// Owner Machine of a MetalMachine, from its Cluster API owner reference
fn owner_machine_key(metal_machine: &MetalMachine) -> Option<ObjectKey> {
    let namespace = metal_machine.namespace().unwrap_or_default();
    metal_machine
        .owner_references()
        .iter()
        .find(|owner| {
            owner.kind == "Machine"
                && owner
                    .api_version
                    .split('/')
                    .next()
                    .is_some_and(|group| group == CLUSTER_API_GROUP)
        })
        .map(|owner| ObjectKey::new(&namespace, &owner.name))
}

fn machine_addresses(binding: &ServerBinding) -> Vec<MachineAddress> {
    let mut addresses: Vec<MachineAddress> = binding
        .spec
        .addresses
        .iter()
        .map(|address| MachineAddress {
            type_: MachineAddressType::InternalIp,
            address: address.clone(),
        })
        .collect();
    if let Some(hostname) = &binding.spec.hostname {
        addresses.push(MachineAddress {
            type_: MachineAddressType::Hostname,
            address: hostname.clone(),
        });
    }
    addresses
}

impl Reconciler {
    /// Reconcile a MetalMachine.
    ///
    /// State is re-read from the store at the start of the pass; the object handed in
    /// by the watch only names what to reconcile.
    pub async fn reconcile_metal_machine(
        &self,
        metal_machine: &MetalMachine,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let key = ObjectKey::of(metal_machine);
        let current = match self.store.get_metal_machine(&key).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                debug!("MetalMachine {} is gone", key);
                self.index.remove_machine(&key);
                return Ok(ReconcileOutcome::Done);
            }
            Err(e) => return Err(e.into()),
        };
        self.index.apply_machine(&current);

        if current.is_deleting() {
            if !current.has_finalizer() {
                return Ok(ReconcileOutcome::Done);
            }
            let mut scope = PatchScope::new(current);
            let result = self.release_metal_machine(&mut scope.object).await;
            return scope.finish(self.store.as_ref(), result).await;
        }

        let Some(owner_key) = owner_machine_key(&current) else {
            info!("MetalMachine {} has no owner Machine yet", key);
            return Ok(ReconcileOutcome::Requeue(WaitReason::OwnerMachineMissing));
        };
        let owner = match self.store.get_machine(&owner_key).await {
            Ok(owner) => owner,
            Err(e) if e.is_not_found() => {
                info!("Owner Machine {} of MetalMachine {} not found", owner_key, key);
                return Ok(ReconcileOutcome::Requeue(WaitReason::OwnerMachineMissing));
            }
            Err(e) => return Err(e.into()),
        };

        let cluster_name = owner.cluster_name().ok_or_else(|| {
            ControllerError::InvalidConfig(format!("Machine {owner_key} does not name its cluster"))
        })?;
        let cluster_key = ObjectKey::new(&key.namespace, &cluster_name);
        let cluster = match self.store.get_cluster(&cluster_key).await {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => {
                info!("Cluster {} of MetalMachine {} not found", cluster_key, key);
                return Ok(ReconcileOutcome::Requeue(WaitReason::ClusterNotReady));
            }
            Err(e) => return Err(e.into()),
        };
        if cluster.spec.paused {
            debug!("Cluster {} is paused, skipping MetalMachine {}", cluster_key, key);
            return Ok(ReconcileOutcome::Requeue(WaitReason::ClusterPaused));
        }
        if !cluster.infrastructure_ready() {
            info!("Waiting for cluster {} infrastructure to be ready", cluster_key);
            return Ok(ReconcileOutcome::Requeue(WaitReason::ClusterNotReady));
        }
        if owner.bootstrap_data_secret().is_none() {
            info!("Waiting for bootstrap data of Machine {}", owner_key);
            return Ok(ReconcileOutcome::Requeue(WaitReason::BootstrapDataMissing));
        }

        let mut scope = PatchScope::new(current);
        let result = self.allocate_metal_machine(&mut scope.object, &cluster_key).await;
        scope.finish(self.store.as_ref(), result).await
    }

    async fn allocate_metal_machine(
        &self,
        metal_machine: &mut MetalMachine,
        cluster: &ObjectKey,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let key = ObjectKey::of(metal_machine);
        metal_machine.add_finalizer();

        if metal_machine.spec.server_ref.is_none() && metal_machine.spec.server_class_ref.is_none() {
            let message = "either a server or a server class reference must be set".to_string();
            error!("MetalMachine {}: {}", key, message);
            let status = metal_machine.status_mut();
            status.failure_reason = Some(INVALID_CONFIGURATION_REASON.to_string());
            status.failure_message = Some(message);
            return Ok(ReconcileOutcome::Done);
        }
        if metal_machine
            .status
            .as_ref()
            .is_some_and(|s| s.failure_reason.as_deref() == Some(INVALID_CONFIGURATION_REASON))
        {
            let status = metal_machine.status_mut();
            status.failure_reason = None;
            status.failure_message = None;
        }

        let server_name = if let Some(server_ref) = &metal_machine.spec.server_ref {
            let server_name = server_ref.name.clone();
            if let Some(wait) = self.ensure_binding_for_server_ref(metal_machine, &server_name).await? {
                return Ok(ReconcileOutcome::Requeue(wait));
            }
            server_name
        } else {
            match self.fetch_server_from_class(metal_machine).await? {
                Some(server_name) => {
                    metal_machine.spec.server_ref = Some(ResourceReference::new(server_name.clone()));
                    server_name
                }
                None => {
                    self.metrics.no_eligible_servers.inc();
                    info!("No eligible servers for MetalMachine {}, retrying later", key);
                    return Ok(ReconcileOutcome::Requeue(WaitReason::NoEligibleServers));
                }
            }
        };

        let provider_id = MetalMachine::provider_id_for(&server_name);
        metal_machine.spec.provider_id = Some(provider_id.clone());

        let binding = match self.store.get_server_binding(&server_name).await {
            Ok(binding) => binding,
            Err(e) if e.is_not_found() => {
                debug!("ServerBinding {} not visible yet", server_name);
                return Ok(ReconcileOutcome::Requeue(WaitReason::BindingNotVisible));
            }
            Err(e) => return Err(e.into()),
        };
        if !binding.is_ready() {
            debug!("ServerBinding {} not ready yet", server_name);
            return Ok(ReconcileOutcome::Requeue(WaitReason::BindingNotReady));
        }

        let status = metal_machine.status_mut();
        status.addresses = machine_addresses(&binding);
        for condition in binding.status.iter().flat_map(|s| s.conditions.iter()) {
            conditions::set(&mut status.conditions, condition.clone());
        }
        if !status.ready {
            info!("MetalMachine {} is ready on server {}", key, server_name);
        }
        status.ready = true;

        match self
            .workload
            .set_node_provider_id(cluster, &server_name, &provider_id)
            .await
        {
            Ok(()) => {
                conditions::mark_true(&mut metal_machine.status_mut().conditions, PROVIDER_SET_CONDITION);
                Ok(ReconcileOutcome::Done)
            }
            Err(e) => {
                warn!("Failed to set providerID on workload node for {}: {}", key, e);
                conditions::mark_false(
                    &mut metal_machine.status_mut().conditions,
                    PROVIDER_SET_CONDITION,
                    PROVIDER_UPDATE_FAILED_REASON,
                    ConditionSeverity::Warning,
                    e.to_string(),
                );
                Ok(ReconcileOutcome::Requeue(WaitReason::ProviderIdNotSet))
            }
        }
    }

    /// Make sure the server named by a direct reference is bound to this machine.
    ///
    /// Returns a wait reason when the binding had to be created in this pass.
    async fn ensure_binding_for_server_ref(
        &self,
        metal_machine: &MetalMachine,
        server_name: &str,
    ) -> Result<Option<WaitReason>, ControllerError> {
        let key = ObjectKey::of(metal_machine);
        match self.store.get_server_binding(server_name).await {
            Ok(binding) if binding.spec.metal_machine_ref.points_to(&key) => return Ok(None),
            Ok(binding) => {
                return Err(ControllerError::ServerAlreadyClaimed(format!(
                    "server {server_name} is bound to {}",
                    binding.spec.metal_machine_ref.key()
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let server = self.store.get_server(server_name).await?;
        if !server.is_accepted() {
            return Err(ControllerError::ServerNotAccepted(server_name.to_string()));
        }

        let Some(assignment) = LegacyAssignment::from_machine(metal_machine) else {
            return Ok(None);
        };
        match self
            .store
            .create_server_binding(&binding_from_legacy_assignment(&assignment))
            .await
        {
            Ok(created) => {
                self.index.apply_binding(&created);
                info!("Created ServerBinding {} for MetalMachine {}", server_name, key);
            }
            // Created concurrently (e.g. by the recovery path); ownership is checked next pass
            Err(e) if e.is_already_exists() => {
                debug!("ServerBinding {} appeared concurrently", server_name);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Some(WaitReason::BindingNotVisible))
    }

    /// Bindings that already reference this machine.
    ///
    /// Index hits are verified against the store. When the index yields nothing the
    /// store is listed, so an index miss is never taken as proof of absence.
    async fn existing_bindings(&self, key: &ObjectKey) -> Result<Vec<ServerBinding>, ControllerError> {
        let mut found = Vec::new();
        for name in self.index.bindings_for_machine(key) {
            match self.store.get_server_binding(&name).await {
                Ok(binding) if binding.spec.metal_machine_ref.points_to(key) => found.push(binding),
                Ok(_) => {}
                Err(e) if e.is_not_found() => self.index.remove_binding(&name),
                Err(e) => return Err(e.into()),
            }
        }
        if found.is_empty() {
            found = self.store.list_server_bindings_for_machine(key).await?;
            for binding in &found {
                self.index.apply_binding(binding);
            }
        }
        found.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(found)
    }

    /// Find or claim a server for a class-based MetalMachine.
    ///
    /// Returns the server name, or `None` when no candidate could be claimed.
    pub(crate) async fn fetch_server_from_class(
        &self,
        metal_machine: &MetalMachine,
    ) -> Result<Option<String>, ControllerError> {
        let key = ObjectKey::of(metal_machine);

        // A binding from an earlier pass whose commit was lost
        if let Some(binding) = self.existing_bindings(&key).await?.into_iter().next() {
            let name = binding.name_any();
            info!("Reusing existing ServerBinding {} for MetalMachine {}", name, key);
            return Ok(Some(name));
        }

        let Some(class_ref) = metal_machine.spec.server_class_ref.as_ref() else {
            return Ok(None);
        };
        let class = self.store.get_server_class(&class_ref.name).await?;

        let mut pool = Vec::new();
        for name in class.available_servers() {
            match self.store.get_server(name).await {
                Ok(server) => pool.push(server),
                Err(e) if e.is_not_found() => debug!("Server {} in class {} is gone", name, class_ref.name),
                Err(e) => return Err(e.into()),
            }
        }

        let class_reference = ResourceReference::to_object(&class);
        for server in filter_accepted_servers(&class.spec, pool)? {
            let name = server.name_any();
            if server.is_in_use() {
                debug!("Server {} is in use, skipping", name);
                continue;
            }
            if !server.is_clean() {
                debug!("Server {} is not clean, skipping", name);
                continue;
            }

            let binding = new_binding(metal_machine, &name, Some(class_reference.clone()));
            match self.store.create_server_binding(&binding).await {
                Ok(created) => {
                    self.index.apply_binding(&created);
                    self.metrics.allocations.inc();
                    info!(
                        "Allocated server {} from class {} to MetalMachine {}",
                        name, class_ref.name, key
                    );
                    return Ok(Some(name));
                }
                Err(e) if e.is_already_exists() => {
                    self.metrics.claim_conflicts.inc();
                    debug!("Server {} was claimed concurrently, trying next candidate", name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Release the claim held by a deleting MetalMachine, then drop the finalizer.
    async fn release_metal_machine(
        &self,
        metal_machine: &mut MetalMachine,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let key = ObjectKey::of(metal_machine);

        let mut names: Vec<String> = self
            .existing_bindings(&key)
            .await?
            .into_iter()
            .map(|binding| binding.name_any())
            .collect();
        if let Some(server_ref) = &metal_machine.spec.server_ref {
            match self.store.get_server_binding(&server_ref.name).await {
                Ok(binding) if binding.spec.metal_machine_ref.points_to(&key) => {
                    names.push(server_ref.name.clone());
                }
                Ok(_) => debug!("ServerBinding {} belongs to another machine", server_ref.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        names.sort();
        names.dedup();

        if !names.is_empty() {
            for name in &names {
                self.store.delete_server_binding(name).await?;
                self.index.remove_binding(name);
                info!("Released server {} held by MetalMachine {}", name, key);
            }
            return Ok(ReconcileOutcome::Requeue(WaitReason::BindingReleasing));
        }

        metal_machine.spec.server_ref = None;
        metal_machine.remove_finalizer();
        info!("MetalMachine {} released", key);
        Ok(ReconcileOutcome::Done)
    }
}
