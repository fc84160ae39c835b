use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive transient poll failures tolerated before giving up.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Provider states meaning the cluster is usable.
    #[serde(default = "default_ready_states")]
    pub ready_states: Vec<String>,
    /// Provider states meaning provisioning will not complete.
    #[serde(default = "default_failed_states")]
    pub failed_states: Vec<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_consecutive_failures() -> u32 {
    12
}

fn default_ready_states() -> Vec<String> {
    vec!["running".to_string()]
}

fn default_failed_states() -> Vec<String> {
    vec![
        "error".to_string(),
        "invalid".to_string(),
        "deleted".to_string(),
    ]
}

fn default_api_url() -> String {
    provider_gateway::digitalocean::DEFAULT_API_URL.to_string()
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            ready_states: default_ready_states(),
            failed_states: default_failed_states(),
            api_url: default_api_url(),
        }
    }
}

impl ProvisionerConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path).await?;
        Ok(serde_yaml_ng::from_str(&data)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn is_ready_state(&self, state: &str) -> bool {
        self.ready_states.iter().any(|s| s.eq_ignore_ascii_case(state))
    }

    pub fn is_failed_state(&self, state: &str) -> bool {
        self.failed_states.iter().any(|s| s.eq_ignore_ascii_case(state))
    }
}
