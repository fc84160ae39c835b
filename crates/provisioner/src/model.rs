use std::fmt;

use chrono::{DateTime, Utc};
use provider_gateway::{ClusterRequest, NodePoolRequest};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ClusterSpec;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default, JsonSchema)]
pub enum ClusterStatus {
    #[default]
    Requested,
    Submitting,
    Provisioning,
    Ready,
    Failed,
}

impl ClusterStatus {
    /// A provisioning operation owns the record.
    pub fn is_active(self) -> bool {
        matches!(self, ClusterStatus::Submitting | ClusterStatus::Provisioning)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ClusterStatus::Ready | ClusterStatus::Failed)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Requested => "REQUESTED",
            ClusterStatus::Submitting => "SUBMITTING",
            ClusterStatus::Provisioning => "PROVISIONING",
            ClusterStatus::Ready => "READY",
            ClusterStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub name: String,
    pub size: String,
    pub count: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_by: u64,
}

/// Persisted aggregate of a cluster and its node pools.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub id: Uuid,
    /// Provider handle, set once by the first successful submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub organization_id: u64,
    pub name: String,
    pub location: String,
    pub version: String,
    pub secret_id: String,
    pub status: ClusterStatus,
    #[serde(default)]
    pub status_message: String,
    /// Set alongside `Failed` when another attempt may succeed: `create`
    /// when nothing reached the provider, `resume` otherwise.
    #[serde(default)]
    pub retryable: bool,
    /// API server of the running cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    pub created_by: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub node_pools: Vec<NodePoolRecord>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ClusterRecord {
    /// In-memory record for a freshly requested cluster, without node pools.
    pub fn new(id: Uuid, spec: &ClusterSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            external_id: None,
            organization_id: spec.organization_id,
            name: spec.name.clone(),
            location: spec.region.clone(),
            version: spec.version.clone(),
            secret_id: spec.secret_id.clone(),
            status: ClusterStatus::Requested,
            status_message: String::new(),
            retryable: false,
            endpoint: None,
            ipv4: None,
            created_by: spec.creator_id,
            created_at: now,
            updated_at: now,
            node_pools: vec![],
            tags: spec.tags.clone(),
        }
    }

    /// Next version of this record with the given status. Not persisted.
    pub fn transition(&self, status: ClusterStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            status_message: message.into(),
            retryable: false,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn create_request(&self) -> ClusterRequest {
        ClusterRequest {
            name: self.name.clone(),
            region: self.location.clone(),
            version: self.version.clone(),
            tags: self.tags.clone(),
            node_pools: self
                .node_pools
                .iter()
                .map(|pool| NodePoolRequest {
                    name: pool.name.clone(),
                    size: pool.size.clone(),
                    count: pool.count,
                    tags: pool.tags.clone(),
                })
                .collect(),
        }
    }
}
