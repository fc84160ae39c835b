use std::collections::BTreeMap;

use garde::Validate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, model::ClusterRecord};

/// Desired state of a managed DigitalOcean Kubernetes cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, Validate, JsonSchema)]
#[kube(
    group = "doks.dev",
    version = "v1",
    kind = "DigitalOceanCluster",
    namespaced
)]
#[kube(status = "ClusterRecord")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1))]
    pub region: String,
    #[garde(skip)]
    pub version: String,
    #[garde(skip)]
    #[serde(default)]
    pub organization_id: u64,
    #[garde(skip)]
    #[serde(default)]
    pub creator_id: u64,
    /// Name of the secret holding provider credentials.
    #[garde(skip)]
    pub secret_id: String,
    #[garde(custom(non_empty_pools), dive)]
    pub node_pools: BTreeMap<String, NodePoolSpec>,
    #[garde(skip)]
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct NodePoolSpec {
    #[garde(length(min = 1))]
    pub size: String,
    #[garde(range(min = 0))]
    pub count: i32,
    #[garde(skip)]
    #[serde(default)]
    pub tags: Vec<String>,
}

fn non_empty_pools(pools: &BTreeMap<String, NodePoolSpec>, _ctx: &()) -> garde::Result {
    if pools.is_empty() {
        return Err(garde::Error::new("at least one node pool is required"));
    }
    Ok(())
}

impl ClusterSpec {
    /// Check the spec, reporting the first violated field.
    pub fn validate_spec(&self) -> Result<()> {
        self.validate().map_err(|report| {
            let (field, reason) = report
                .iter()
                .next()
                .map(|(path, err)| (path.to_string(), err.to_string()))
                .unwrap_or_default();
            Error::InvalidSpec { field, reason }
        })
    }
}
