//! Controller-specific error types.
//!
//! Waiting on another actor (no eligible server yet, binding not visible yet, owner
//! not ready) is not an error; reconcilers report that as a requeue outcome. These
//! variants are the failures that go through the error policy and its backoff.

use metal_store::StoreError;
use thiserror::Error;

/// Errors that can occur in the metal allocator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Store (Kubernetes API) error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// ServerClass selector could not be evaluated
    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Directly referenced server has not been accepted
    #[error("Server not accepted: {0}")]
    ServerNotAccepted(String),

    /// Directly referenced server is bound to another MetalMachine
    #[error("Server already claimed: {0}")]
    ServerAlreadyClaimed(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry or endpoint failure
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for ControllerError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
