//! Kubernetes resource watchers.
//!
//! Each reconciled kind runs under its own `kube_runtime::Controller`, which handles
//! reconnection, per-object serialization and requeues. Secondary watches map changes
//! on related kinds back to the objects that need another pass:
//! - ServerBinding -> the MetalMachine it references
//! - Server -> its ServerBinding, and every ServerClass
//! - MetalMachine, ServerBinding -> the Server they name
//!
//! Two plain watch streams keep the reverse index current.

use crate::error::ControllerError;
use crate::index::{binding_for_server, machine_for_binding, server_for_binding, server_for_machine};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crds::{MetalMachine, ObjectKey, Server, ServerBinding, ServerClass};
use futures::StreamExt;
use kube::{Api, Client, Resource};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<ReconcileOutcome, ControllerError>> + Send>>;

/// Controller tuning shared by every watched kind
#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    /// Wait after the last event before reconciling
    pub debounce: Duration,
    /// Concurrent reconciliations per kind
    pub concurrency: u16,
}

/// Run a controller until shutdown.
///
/// Successful passes reset the object's error backoff and map their outcome to an
/// action; failures go through the error policy, which requeues with a per-object
/// Fibonacci backoff.
async fn run_controller<K, F>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &'static str,
    settings: WatchSettings,
) -> Result<(), ControllerError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} controller", resource_name);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = format!("{resource_name}/{}", ObjectKey::of(obj.as_ref()));
        let delay = ctx.next_backoff(&key);
        ctx.metrics().record_reconcile(resource_name, "error");
        error!(
            "Reconciliation error for {} (attempt {}), retrying in {:?}: {}",
            key,
            ctx.error_count(&key),
            delay,
            error
        );
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = format!("{resource_name}/{}", ObjectKey::of(obj.as_ref()));
            debug!("Reconciling {}", key);

            match reconcile_fn(ctx.clone(), obj).await {
                Ok(outcome) => {
                    ctx.reset_backoff(&key);
                    ctx.metrics().record_reconcile(resource_name, outcome.label());
                    if let ReconcileOutcome::Requeue(reason) = outcome {
                        debug!("{} waiting: {}", key, reason.as_str());
                    }
                    Ok(ctx.action_for(outcome))
                }
                Err(e) => Err(e),
            }
        }
    };

    let controller_config = ControllerConfig::default()
        .debounce(settings.debounce)
        .concurrency(settings.concurrency);

    controller
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!("Controller error for {}: {}", resource_name, e);
            }
        })
        .await;

    info!("{} controller stopped", resource_name);
    Ok(())
}

/// Watches metal resources and drives their reconcilers.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    metal_machine_api: Api<MetalMachine>,
    server_binding_api: Api<ServerBinding>,
    server_api: Api<Server>,
    server_class_api: Api<ServerClass>,
    settings: WatchSettings,
}

impl Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("settings", &self.settings).finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance. MetalMachines are watched in `namespace` when
    /// set; the other kinds are cluster-scoped.
    pub fn new(
        reconciler: Arc<Reconciler>,
        client: &Client,
        namespace: Option<&str>,
        settings: WatchSettings,
    ) -> Self {
        let metal_machine_api = match namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        Self {
            reconciler,
            metal_machine_api,
            server_binding_api: Api::all(client.clone()),
            server_api: Api::all(client.clone()),
            server_class_api: Api::all(client.clone()),
            settings,
        }
    }

    /// Reconciles MetalMachines, re-triggered by changes to their bindings.
    pub async fn watch_metal_machines(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.metal_machine_api.clone(), watcher::Config::default())
            .watches(
                self.server_binding_api.clone(),
                watcher::Config::default(),
                |binding| machine_for_binding(&binding),
            );
        run_controller(
            controller,
            self.reconciler.clone(),
            |reconciler, resource| {
                Box::pin(async move { reconciler.reconcile_metal_machine(&resource).await })
            },
            "MetalMachine",
            self.settings,
        )
        .await
    }

    /// Reconciles ServerBindings, re-triggered when the claimed server changes.
    pub async fn watch_server_bindings(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.server_binding_api.clone(), watcher::Config::default())
            .watches(self.server_api.clone(), watcher::Config::default(), |server| {
                Some(binding_for_server(&server))
            });
        run_controller(
            controller,
            self.reconciler.clone(),
            |reconciler, resource| {
                Box::pin(async move { reconciler.reconcile_server_binding(&resource).await })
            },
            "ServerBinding",
            self.settings,
        )
        .await
    }

    /// Reconciles Servers, re-triggered when a machine reference or binding for them
    /// changes.
    pub async fn watch_servers(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.server_api.clone(), watcher::Config::default())
            .watches(
                self.metal_machine_api.clone(),
                watcher::Config::default(),
                |machine| server_for_machine(&machine),
            )
            .watches(self.server_binding_api.clone(), watcher::Config::default(), |binding| {
                Some(server_for_binding(&binding))
            });
        run_controller(
            controller,
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_server(&resource).await }),
            "Server",
            self.settings,
        )
        .await
    }

    /// Reconciles ServerClasses; any server change re-evaluates every class.
    pub async fn watch_server_classes(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.server_class_api.clone(), watcher::Config::default());
        let classes = controller.store();
        let controller = controller.watches(self.server_api.clone(), watcher::Config::default(), move |_server| {
            classes
                .state()
                .into_iter()
                .map(|class| ObjectRef::from_obj(&*class))
                .collect::<Vec<_>>()
        });
        run_controller(
            controller,
            self.reconciler.clone(),
            |reconciler, resource| {
                Box::pin(async move { reconciler.reconcile_server_class(&resource).await })
            },
            "ServerClass",
            self.settings,
        )
        .await
    }

    /// Keeps the binding side of the reverse index current.
    pub async fn watch_binding_index(&self) -> Result<(), ControllerError> {
        info!("Starting ServerBinding index watcher");
        let index = self.reconciler.index().clone();
        let mut stream = Box::pin(
            watcher(self.server_binding_api.clone(), watcher::Config::default()).default_backoff(),
        );
        let mut staged = Vec::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(watcher::Event::Apply(binding)) => index.apply_binding(&binding),
                Ok(watcher::Event::Delete(binding)) => {
                    if let Some(name) = binding.metadata.name.as_deref() {
                        index.remove_binding(name);
                    }
                }
                Ok(watcher::Event::Init) => staged.clear(),
                Ok(watcher::Event::InitApply(binding)) => staged.push(binding),
                Ok(watcher::Event::InitDone) => {
                    index.replace_bindings(staged.iter());
                    debug!("ServerBinding index rebuilt with {} entries", staged.len());
                    staged.clear();
                }
                Err(e) => warn!("ServerBinding index watch error: {}", e),
            }
        }

        Ok(())
    }

    /// Keeps the machine side of the reverse index current.
    pub async fn watch_machine_index(&self) -> Result<(), ControllerError> {
        info!("Starting MetalMachine index watcher");
        let index = self.reconciler.index().clone();
        let mut stream = Box::pin(
            watcher(self.metal_machine_api.clone(), watcher::Config::default()).default_backoff(),
        );
        let mut staged = Vec::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(watcher::Event::Apply(machine)) => index.apply_machine(&machine),
                Ok(watcher::Event::Delete(machine)) => index.remove_machine(&ObjectKey::of(&machine)),
                Ok(watcher::Event::Init) => staged.clear(),
                Ok(watcher::Event::InitApply(machine)) => staged.push(machine),
                Ok(watcher::Event::InitDone) => {
                    index.replace_machines(staged.iter());
                    debug!("MetalMachine index rebuilt with {} entries", staged.len());
                    staged.clear();
                }
                Err(e) => warn!("MetalMachine index watch error: {}", e),
            }
        }

        Ok(())
    }
}
