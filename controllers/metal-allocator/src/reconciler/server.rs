//! Server reconciler
//!
//! Recovers claims whose binding is missing: when a MetalMachine still references a
//! server (older claim representation, or a binding deleted out from under it) the
//! binding is recreated from that reference.

use super::{ReconcileOutcome, Reconciler};
use crate::error::ControllerError;
use crds::conversion::{binding_from_legacy_assignment, LegacyAssignment};
use crds::{MetalMachine, ObjectKey, Server};
use kube::ResourceExt;
use tracing::{debug, info};

impl Reconciler {
    /// Reconcile a Server
    pub async fn reconcile_server(&self, server: &Server) -> Result<ReconcileOutcome, ControllerError> {
        let name = server.name_any();
        match self.store.get_server_binding(&name).await {
            Ok(_) => return Ok(ReconcileOutcome::Done),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(machine) = self.heal_missing_binding(&name).await? {
            info!("Recreated ServerBinding {} for MetalMachine {}", name, machine);
        }
        Ok(ReconcileOutcome::Done)
    }

    /// MetalMachines referencing `server`, index first with a store fallback
    async fn machines_referencing(&self, server: &str) -> Result<Vec<MetalMachine>, ControllerError> {
        let mut found = Vec::new();
        for key in self.index.machines_for_server(server) {
            match self.store.get_metal_machine(&key).await {
                Ok(machine)
                    if machine
                        .spec
                        .server_ref
                        .as_ref()
                        .is_some_and(|r| r.name == server) =>
                {
                    found.push(machine);
                }
                Ok(machine) => self.index.apply_machine(&machine),
                Err(e) if e.is_not_found() => self.index.remove_machine(&key),
                Err(e) => return Err(e.into()),
            }
        }
        if found.is_empty() {
            found = self.store.list_metal_machines_for_server(server).await?;
            for machine in &found {
                self.index.apply_machine(machine);
            }
        }
        found.sort_by_key(ObjectKey::of);
        Ok(found)
    }

    /// Recreate the binding for `server` from a MetalMachine still referencing it.
    ///
    /// Returns the machine the binding was created for, or `None` when no live machine
    /// references the server or a binding appeared concurrently.
    pub(crate) async fn heal_missing_binding(
        &self,
        server: &str,
    ) -> Result<Option<ObjectKey>, ControllerError> {
        for machine in self.machines_referencing(server).await? {
            let key = ObjectKey::of(&machine);
            if machine.is_deleting() {
                debug!("MetalMachine {} is deleting, not recreating its binding", key);
                continue;
            }
            let Some(assignment) = LegacyAssignment::from_machine(&machine) else {
                continue;
            };

            return match self
                .store
                .create_server_binding(&binding_from_legacy_assignment(&assignment))
                .await
            {
                Ok(created) => {
                    self.index.apply_binding(&created);
                    Ok(Some(key))
                }
                Err(e) if e.is_already_exists() => {
                    debug!("ServerBinding {} already recreated", server);
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            };
        }
        Ok(None)
    }
}
