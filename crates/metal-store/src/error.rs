//! Store errors

use thiserror::Error;

/// Errors that can occur when reading or writing metal resources
#[derive(Debug, Error)]
pub enum StoreError {
    /// Resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create collided with an existing resource of the same identity
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Write was rejected because the resource changed underneath it
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other Kubernetes API failure
    #[error("Kubernetes error: {0}")]
    Kube(kube::Error),

    /// Workload cluster kubeconfig could not be loaded
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request could not be satisfied as asked (e.g., ambiguous node match)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    /// Classify a kube error for the object described by `what`
    pub fn from_kube(err: kube::Error, what: impl Into<String>) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound(what.into()),
            kube::Error::Api(response)
                if response.code == 409 && response.reason == "AlreadyExists" =>
            {
                Self::AlreadyExists(what.into())
            }
            kube::Error::Api(response) if response.code == 409 => Self::Conflict(what.into()),
            _ => Self::Kube(err),
        }
    }

    /// Resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Create collided with an existing resource
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        Self::from_kube(err, "resource")
    }
}
