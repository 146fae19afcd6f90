//! Reconciliation logic for the metal allocator.
//!
//! One module per watched kind:
//! - `metal_machine`: allocation protocol and release
//! - `server_binding`: binding readiness
//! - `server`: recovery of bindings missing for an existing claim
//! - `server_class`: class pool aggregation and the built-in `any` class

pub mod metal_machine;
pub mod server;
pub mod server_binding;
pub mod server_class;
#[cfg(test)]
mod metal_machine_test;
#[cfg(test)]
mod server_class_test;

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::index::ReverseIndex;
use crate::metrics::Metrics;
use kube_runtime::controller::Action;
use metal_store::{MetalStore, WorkloadClusterClient};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

/// Why a pass ended without reaching its goal. None of these are errors: each one
/// waits on another actor and is retried after a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Owner Machine not set or not found
    OwnerMachineMissing,
    /// Cluster not found or its infrastructure is not ready
    ClusterNotReady,
    /// Cluster reconciliation is paused
    ClusterPaused,
    /// Owner Machine has no bootstrap data yet
    BootstrapDataMissing,
    /// No server in the class pool could be claimed
    NoEligibleServers,
    /// Binding not visible yet
    BindingNotVisible,
    /// Binding exists but has not been confirmed ready
    BindingNotReady,
    /// Provider ID could not be stamped onto the workload node
    ProviderIdNotSet,
    /// Binding deleted, waiting for it to disappear
    BindingReleasing,
}

impl WaitReason {
    /// Short label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OwnerMachineMissing => "owner_machine_missing",
            Self::ClusterNotReady => "cluster_not_ready",
            Self::ClusterPaused => "cluster_paused",
            Self::BootstrapDataMissing => "bootstrap_data_missing",
            Self::NoEligibleServers => "no_eligible_servers",
            Self::BindingNotVisible => "binding_not_visible",
            Self::BindingNotReady => "binding_not_ready",
            Self::ProviderIdNotSet => "provider_id_not_set",
            Self::BindingReleasing => "binding_releasing",
        }
    }
}

/// Result of a successful reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do until the object changes
    Done,
    /// Re-check after the configured delay
    Requeue(WaitReason),
}

impl ReconcileOutcome {
    /// Label used for metrics
    pub fn label(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Requeue(reason) => reason.as_str(),
        }
    }
}

/// Backoff state for a resource
#[derive(Debug, Clone, Default)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

/// Reconciles metal resources.
pub struct Reconciler {
    pub(crate) store: Box<dyn MetalStore>,
    pub(crate) workload: Box<dyn WorkloadClusterClient>,
    pub(crate) index: ReverseIndex,
    pub(crate) metrics: Metrics,
    pub(crate) requeue_after: Duration,
    /// Error tracking per resource (kind/namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("requeue_after", &self.requeue_after)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        store: impl MetalStore + 'static,
        workload: impl WorkloadClusterClient + 'static,
        index: ReverseIndex,
        metrics: Metrics,
        requeue_after: Duration,
    ) -> Self {
        Self {
            store: Box::new(store),
            workload: Box::new(workload),
            index,
            metrics,
            requeue_after,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Shared reverse index
    pub fn index(&self) -> &ReverseIndex {
        &self.index
    }

    /// Metrics handle
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Map a pass outcome to the controller action
    pub fn action_for(&self, outcome: ReconcileOutcome) -> Action {
        match outcome {
            ReconcileOutcome::Done => Action::await_change(),
            ReconcileOutcome::Requeue(_) => Action::requeue(self.requeue_after),
        }
    }

    /// Next retry delay for a resource that just failed
    pub fn next_backoff(&self, resource_key: &str) -> Duration {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(resource_key.to_string()).or_default();
        state.error_count += 1;
        state.backoff.next_backoff()
    }

    /// Consecutive failures recorded for a resource
    pub fn error_count(&self, resource_key: &str) -> u32 {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_key)
            .map_or(0, |state| state.error_count)
    }

    /// Forget failures after a successful pass
    pub fn reset_backoff(&self, resource_key: &str) {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource_key);
    }

    /// Rebuild the reverse index from full lists and make sure the `any` class exists.
    pub async fn startup_reconciliation(&self) -> Result<(), ControllerError> {
        self.ensure_server_class_any().await?;

        let bindings = self.store.list_server_bindings().await?;
        let machines = self.store.list_metal_machines().await?;
        self.index.replace_bindings(bindings.iter());
        self.index.replace_machines(machines.iter());
        info!(
            "Indexed {} ServerBindings and {} MetalMachines",
            bindings.len(),
            machines.len()
        );
        Ok(())
    }
}
