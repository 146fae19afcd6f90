//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the store, reconciler and
//! watchers together and runs them until one of them stops.

use crate::config::AllocatorConfig;
use crate::error::ControllerError;
use crate::index::ReverseIndex;
use crate::metrics::{self, Metrics};
use crate::reconciler::Reconciler;
use crate::watcher::{WatchSettings, Watcher};
use kube::Client;
use metal_store::{KubeStore, KubeWorkloadClient, StoreError};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type Task = JoinHandle<Result<(), ControllerError>>;

/// Main controller for bare-metal allocation.
#[derive(Debug)]
pub struct Controller {
    metal_machine_watcher: Task,
    server_binding_watcher: Task,
    server_watcher: Task,
    server_class_watcher: Task,
    binding_index_watcher: Task,
    machine_index_watcher: Task,
    metrics_server: Task,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: AllocatorConfig) -> Result<Self, ControllerError> {
        info!("Initializing Metal Allocator");

        // Create Kubernetes client
        let kube_client = Client::try_default()
            .await
            .map_err(|e| ControllerError::Store(StoreError::Kube(e)))?;

        let store = KubeStore::new(kube_client.clone(), config.namespace.clone());
        let workload = KubeWorkloadClient::new(kube_client.clone());
        let metrics = Metrics::new()?;
        let index = ReverseIndex::new();

        let reconciler = Arc::new(Reconciler::new(
            store,
            workload,
            index,
            metrics.clone(),
            config.requeue_after,
        ));

        // Watch restarts rebuild the index anyway; a failure here only delays readiness
        if let Err(e) = reconciler.startup_reconciliation().await {
            warn!("Startup reconciliation failed: {}", e);
        }

        let watcher = Arc::new(Watcher::new(
            reconciler,
            &kube_client,
            config.namespace.as_deref(),
            WatchSettings {
                debounce: config.debounce,
                concurrency: config.concurrency,
            },
        ));

        let w = watcher.clone();
        let metal_machine_watcher = tokio::spawn(async move { w.watch_metal_machines().await });
        let w = watcher.clone();
        let server_binding_watcher = tokio::spawn(async move { w.watch_server_bindings().await });
        let w = watcher.clone();
        let server_watcher = tokio::spawn(async move { w.watch_servers().await });
        let w = watcher.clone();
        let server_class_watcher = tokio::spawn(async move { w.watch_server_classes().await });
        let w = watcher.clone();
        let binding_index_watcher = tokio::spawn(async move { w.watch_binding_index().await });
        let w = watcher;
        let machine_index_watcher = tokio::spawn(async move { w.watch_machine_index().await });

        let metrics_addr = config.metrics_addr;
        let metrics_server = tokio::spawn(async move { metrics::serve(metrics_addr, metrics).await });

        Ok(Self {
            metal_machine_watcher,
            server_binding_watcher,
            server_watcher,
            server_class_watcher,
            binding_index_watcher,
            machine_index_watcher,
            metrics_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Metal Allocator running");

        // Controllers stop on SIGTERM/SIGINT; the first task to exit ends the process
        let (name, result) = tokio::select! {
            result = &mut self.metal_machine_watcher => ("MetalMachine controller", result),
            result = &mut self.server_binding_watcher => ("ServerBinding controller", result),
            result = &mut self.server_watcher => ("Server controller", result),
            result = &mut self.server_class_watcher => ("ServerClass controller", result),
            result = &mut self.binding_index_watcher => ("ServerBinding index watcher", result),
            result = &mut self.machine_index_watcher => ("MetalMachine index watcher", result),
            result = &mut self.metrics_server => ("metrics server", result),
        };

        result
            .map_err(|e| ControllerError::Watch(format!("{name} panicked: {e}")))?
            .map_err(|e| ControllerError::Watch(format!("{name} error: {e}")))?;
        info!("{} exited, shutting down", name);
        Ok(())
    }
}
