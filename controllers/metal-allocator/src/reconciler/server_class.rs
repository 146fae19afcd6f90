//! ServerClass reconciler
//!
//! Materializes each class's qualifying servers into its status and keeps the
//! built-in `any` class present and unrestricted.

use super::{ReconcileOutcome, Reconciler};
use crate::error::ControllerError;
use crate::qualification::filter_accepted_servers;
use crds::{ServerClass, ServerClassSpec, ServerClassStatus, SERVER_CLASS_ANY};
use kube::ResourceExt;
use tracing::{debug, info};

impl Reconciler {
    /// Reconcile a ServerClass
    pub async fn reconcile_server_class(
        &self,
        class: &ServerClass,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let name = class.name_any();
        let mut current = match self.store.get_server_class(&name).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                debug!("ServerClass {} is gone", name);
                return Ok(ReconcileOutcome::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if name == SERVER_CLASS_ANY
            && (current.spec.selector.is_some() || !current.spec.qualifiers.is_empty())
        {
            let spec = ServerClassSpec {
                environment_ref: current.spec.environment_ref.clone(),
                ..Default::default()
            };
            self.store.update_server_class_spec(&name, &spec).await?;
            info!("Reset restrictions on the {} server class", SERVER_CLASS_ANY);
            current.spec = spec;
        }

        let servers = self.store.list_servers().await?;
        let (in_use, available): (Vec<_>, Vec<_>) = filter_accepted_servers(&current.spec, servers)?
            .into_iter()
            .partition(|server| server.is_in_use());

        let status = ServerClassStatus {
            servers_available: available.iter().map(ResourceExt::name_any).collect(),
            servers_in_use: in_use.iter().map(ResourceExt::name_any).collect(),
        };
        if current.status.as_ref() != Some(&status) {
            debug!(
                "ServerClass {}: {} available, {} in use",
                name,
                status.servers_available.len(),
                status.servers_in_use.len()
            );
            self.store.update_server_class_status(&name, &status).await?;
        }
        Ok(ReconcileOutcome::Done)
    }

    /// Create the built-in `any` class if it does not exist
    pub async fn ensure_server_class_any(&self) -> Result<(), ControllerError> {
        let class = ServerClass::new(SERVER_CLASS_ANY, ServerClassSpec::default());
        match self.store.create_server_class(&class).await {
            Ok(_) => {
                info!("Created the {} server class", SERVER_CLASS_ANY);
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
