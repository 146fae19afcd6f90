//! ServerBinding reconciler
//!
//! A binding is ready while the server it claims still exists.

use super::{ReconcileOutcome, Reconciler};
use crate::error::ControllerError;
use crate::patch::PatchScope;
use crds::{ServerBinding, ServerBindingStatus};
use kube::ResourceExt;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Reconcile a ServerBinding
    pub async fn reconcile_server_binding(
        &self,
        binding: &ServerBinding,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let name = binding.name_any();
        let current = match self.store.get_server_binding(&name).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                debug!("ServerBinding {} is gone", name);
                self.index.remove_binding(&name);
                return Ok(ReconcileOutcome::Done);
            }
            Err(e) => return Err(e.into()),
        };
        self.index.apply_binding(&current);

        let mut scope = PatchScope::new(current);
        let result = self.refresh_binding_readiness(&mut scope.object).await;
        scope.finish(self.store.as_ref(), result).await
    }

    async fn refresh_binding_readiness(
        &self,
        binding: &mut ServerBinding,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let name = binding.name_any();
        let ready = match self.store.get_server(&name).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };

        let status = binding.status.get_or_insert_with(ServerBindingStatus::default);
        if status.ready != ready {
            if ready {
                info!("ServerBinding {} is ready", name);
            } else {
                warn!("Server {} claimed by a binding no longer exists", name);
            }
        }
        status.ready = ready;
        Ok(ReconcileOutcome::Done)
    }
}
