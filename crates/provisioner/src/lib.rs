/// K8s API objects and the desired-state model
pub mod api;

/// Runtime configuration
pub mod config;

/// Persisted cluster and node pool records
pub mod model;

/// Cluster creation, polling and deletion
pub mod provisioning;

/// K8s reconciliation logic
pub mod reconcilers;

/// Credential resolution
pub mod secret;

/// Record persistence
pub mod store;

use provider_gateway::GatewayError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid cluster spec: {field}: {reason}")]
    InvalidSpec { field: String, reason: String },
    #[error("a cluster must declare at least one node pool")]
    EmptyDesiredSet,
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Cluster record not found: {0}")]
    NotFound(Uuid),
    #[error("Cluster {0} already has a provisioning operation in progress or completed")]
    AlreadyProvisioning(Uuid),
    #[error("Cluster {0} is not ready")]
    NotReady(Uuid),
    #[error("Cluster {0} has no provisioning operation to resume")]
    NotStarted(Uuid),
    #[error("Secret error: {0}")]
    Secret(String),
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Serde error: {0}")]
    SerdeYaml(#[from] serde_yaml_ng::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Missing field in object reference")]
    MissingField,
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
