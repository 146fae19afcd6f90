//! Scoped commit of reconciled objects
//!
//! A reconcile pass mutates an in-memory copy of its object. `PatchScope::finish`
//! writes whatever changed back to the store on every exit path, success or error,
//! and combines the two outcomes: the reconcile error wins, a commit error is
//! surfaced only when the pass itself succeeded.
//!
//! Spec and metadata are written first, guarded by the resource version read at the
//! start of the pass; status goes through the status subresource afterwards.

use crate::error::ControllerError;
use crds::{MetalMachine, ObjectKey, ServerBinding};
use kube::ResourceExt;
use metal_store::{MetalStore, StoreError};
use tracing::{debug, error};

/// An object the scope knows how to write back.
#[async_trait::async_trait]
pub trait Committable: Clone + Send + Sync {
    /// Persist the difference between `before` and `after`
    async fn commit(store: &dyn MetalStore, before: &Self, after: &Self) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl Committable for MetalMachine {
    async fn commit(store: &dyn MetalStore, before: &Self, after: &Self) -> Result<(), StoreError> {
        let key = ObjectKey::of(after);

        let body_changed =
            before.metadata.finalizers != after.metadata.finalizers || before.spec != after.spec;
        if body_changed {
            store.update_metal_machine(after).await?;
        }

        if before.status != after.status {
            let status = after.status.clone().unwrap_or_default();
            match store.update_metal_machine_status(&key, &status).await {
                // The finalizer write above may have let the API server remove the object
                Err(StoreError::NotFound(_)) if after.is_deleting() && !after.has_finalizer() => {
                    debug!("MetalMachine {} removed before its status was written", key);
                }
                other => other?,
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Committable for ServerBinding {
    async fn commit(store: &dyn MetalStore, before: &Self, after: &Self) -> Result<(), StoreError> {
        if before.status != after.status {
            let status = after.status.clone().unwrap_or_default();
            store.update_server_binding_status(&after.name_any(), &status).await?;
        }
        Ok(())
    }
}

/// Snapshot of an object plus the working copy a reconcile pass mutates.
#[derive(Debug)]
pub struct PatchScope<K> {
    original: K,
    /// Working copy
    pub object: K,
}

impl<K: Committable> PatchScope<K> {
    /// Open a scope over `object`
    pub fn new(object: K) -> Self {
        Self {
            original: object.clone(),
            object,
        }
    }

    /// Commit the working copy and merge the commit outcome with the pass result
    pub async fn finish<T>(
        self,
        store: &dyn MetalStore,
        result: Result<T, ControllerError>,
    ) -> Result<T, ControllerError> {
        let committed = K::commit(store, &self.original, &self.object).await;
        match (result, committed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(commit_err)) => Err(commit_err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(commit_err)) => {
                error!("Failed to commit after reconcile error ({}): {}", err, commit_err);
                Err(err)
            }
        }
    }
}
