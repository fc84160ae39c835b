/// DigitalOcean Kubernetes (DOKS) client
pub mod digitalocean;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use digitalocean::{DigitalOceanCredentials, DigitalOceanGateway};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Network, rate limit or server-side failure. Safe to try again later.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Authentication, quota or validation failure. Retrying won't help.
    #[error("{0}")]
    Fatal(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    /// The provider's message, verbatim.
    pub fn message(&self) -> &str {
        match self {
            GatewayError::Transient(msg) | GatewayError::Fatal(msg) | GatewayError::NotFound(msg) => {
                msg
            }
        }
    }
}

/// Body of a create cluster call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub name: String,
    pub region: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub node_pools: Vec<NodePoolRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolRequest {
    pub name: String,
    pub size: String,
    pub count: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Cluster state as reported by the provider, e.g. `provisioning` or `running`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
    /// API server URL, known once the control plane is up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
}

impl ProviderStatus {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, ipv4: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self.ipv4 = Some(ipv4.into());
        self
    }

    /// Human readable description, falling back to the raw state.
    pub fn describe(&self) -> String {
        match self.message.as_deref() {
            Some(msg) if !msg.is_empty() => msg.to_string(),
            _ => self.state.clone(),
        }
    }
}

/// Result of an accepted create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub external_id: String,
    pub status: ProviderStatus,
    /// Provider ids of the created node pools, keyed by pool name.
    pub node_pool_ids: BTreeMap<String, String>,
}

/// Remote cluster lifecycle API of a cloud provider.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    async fn submit_create(&self, request: &ClusterRequest) -> Result<Submission, GatewayError>;

    async fn fetch_status(&self, external_id: &str) -> Result<ProviderStatus, GatewayError>;

    /// Only meaningful once the cluster is running.
    async fn fetch_kubeconfig(&self, external_id: &str) -> Result<Vec<u8>, GatewayError>;

    /// Returns `GatewayError::NotFound` when the cluster is already gone.
    async fn delete_cluster(&self, external_id: &str) -> Result<(), GatewayError>;
}
