use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{Level, instrument};

use crate::{ClusterRequest, GatewayError, ProviderGateway, ProviderStatus, Submission};

pub const DEFAULT_API_URL: &str = "https://api.digitalocean.com";

/// Key of the access token inside a resolved secret.
pub const ACCESS_TOKEN_KEY: &str = "personal_access_token";

#[derive(Clone)]
pub struct DigitalOceanCredentials {
    access_token: String,
}

impl DigitalOceanCredentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    pub fn from_values(values: &BTreeMap<String, String>) -> Result<Self, GatewayError> {
        values
            .get(ACCESS_TOKEN_KEY)
            .filter(|token| !token.is_empty())
            .map(|token| Self::new(token.clone()))
            .ok_or_else(|| {
                GatewayError::Fatal(format!("credentials are missing the {ACCESS_TOKEN_KEY} key"))
            })
    }
}

impl fmt::Debug for DigitalOceanCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalOceanCredentials")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DigitalOceanGateway {
    base_url: String,
    http: Client,
    credentials: DigitalOceanCredentials,
}

impl DigitalOceanGateway {
    pub fn new(credentials: DigitalOceanCredentials) -> Result<Self, GatewayError> {
        Self::with_base_url(DEFAULT_API_URL, credentials)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        credentials: DigitalOceanCredentials,
    ) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Fatal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into(),
            http,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        self.api_url(&format!("/kubernetes/clusters{path}"))
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/v2{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Check the access token against the account endpoint.
    ///
    /// A rejected token comes back as `GatewayError::Fatal` with the
    /// provider's message.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn verify_credentials(&self) -> Result<(), GatewayError> {
        let response = self.send(self.http.get(self.api_url("/account"))).await?;
        let envelope: AccountEnvelope = response.json().await.map_err(classify_transport)?;

        match envelope.account.status.as_str() {
            "" | "active" => Ok(()),
            status => Err(GatewayError::Fatal(format!("account is {status}"))),
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, GatewayError> {
        let response = builder
            .bearer_auth(&self.credentials.access_token)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl ProviderGateway for DigitalOceanGateway {
    #[instrument(level = Level::DEBUG, skip(self, request), fields(cluster = %request.name))]
    async fn submit_create(&self, request: &ClusterRequest) -> Result<Submission, GatewayError> {
        let response = self.send(self.http.post(self.url("")).json(request)).await?;
        let envelope: ClusterEnvelope = response.json().await.map_err(classify_transport)?;

        Ok(envelope.kubernetes_cluster.into())
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_status(&self, external_id: &str) -> Result<ProviderStatus, GatewayError> {
        let response = self
            .send(self.http.get(self.url(&format!("/{external_id}"))))
            .await?;
        let envelope: ClusterEnvelope = response.json().await.map_err(classify_transport)?;

        Ok(envelope.kubernetes_cluster.observed_status())
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_kubeconfig(&self, external_id: &str) -> Result<Vec<u8>, GatewayError> {
        let response = self
            .send(
                self.http
                    .get(self.url(&format!("/{external_id}/kubeconfig"))),
            )
            .await?;
        let bytes = response.bytes().await.map_err(classify_transport)?;

        Ok(bytes.to_vec())
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn delete_cluster(&self, external_id: &str) -> Result<(), GatewayError> {
        self.send(self.http.delete(self.url(&format!("/{external_id}"))))
            .await?;

        Ok(())
    }
}

fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() || err.is_connect() {
        GatewayError::Transient(err.to_string())
    } else {
        GatewayError::Fatal(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .map(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("unexpected response status {status}"));

    match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            GatewayError::Transient(message)
        }
        s if s.is_server_error() => GatewayError::Transient(message),
        _ => GatewayError::Fatal(message),
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AccountEnvelope {
    account: AccountBody,
}

#[derive(Debug, Deserialize)]
struct AccountBody {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ClusterEnvelope {
    kubernetes_cluster: ClusterBody,
}

#[derive(Debug, Deserialize)]
struct ClusterBody {
    id: String,
    #[serde(default)]
    status: ProviderStatus,
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    ipv4: String,
    #[serde(default)]
    node_pools: Vec<NodePoolBody>,
}

impl ClusterBody {
    fn observed_status(&self) -> ProviderStatus {
        let mut status = self.status.clone();
        if !self.endpoint.is_empty() {
            status = status.with_endpoint(&self.endpoint, &self.ipv4);
        }
        status
    }
}

#[derive(Debug, Deserialize)]
struct NodePoolBody {
    id: String,
    name: String,
}

impl From<ClusterBody> for Submission {
    fn from(body: ClusterBody) -> Self {
        Submission {
            status: body.observed_status(),
            external_id: body.id,
            node_pool_ids: body
                .node_pools
                .into_iter()
                .map(|pool| (pool.name, pool.id))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_error_classes() {
        let body = r#"{"id":"unauthorized","message":"Unable to authenticate you."}"#;
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, body),
            GatewayError::Fatal("Unable to authenticate you.".into())
        );

        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_retryable());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, "").is_retryable());

        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            GatewayError::NotFound(_)
        ));
    }

    #[test]
    fn malformed_request_is_not_retried() {
        let err = Client::new()
            .get("not a url")
            .build()
            .expect_err("relative url must be rejected");
        assert!(matches!(classify_transport(err), GatewayError::Fatal(_)));
    }

    #[test]
    fn endpoint_is_reported_once_assigned() {
        let body = r#"{
            "kubernetes_cluster": {
                "id": "do-123",
                "status": {"state": "running"},
                "endpoint": "https://do-123.k8s.ondigitalocean.com",
                "ipv4": "203.0.113.10"
            }
        }"#;
        let envelope: ClusterEnvelope = serde_json::from_str(body).unwrap();
        let status = envelope.kubernetes_cluster.observed_status();
        assert_eq!(
            status.endpoint.as_deref(),
            Some("https://do-123.k8s.ondigitalocean.com")
        );
        assert_eq!(status.ipv4.as_deref(), Some("203.0.113.10"));

        let pending: ClusterEnvelope = serde_json::from_str(
            r#"{"kubernetes_cluster": {"id": "do-123", "status": {"state": "provisioning"}, "endpoint": ""}}"#,
        )
        .unwrap();
        assert!(pending.kubernetes_cluster.observed_status().endpoint.is_none());
    }

    #[test]
    fn unparseable_error_body_falls_back_to_status() {
        let err = classify_status(StatusCode::FORBIDDEN, "<html>nope</html>");
        assert_eq!(err.message(), "unexpected response status 403 Forbidden");
    }

    #[test]
    fn create_response_becomes_submission() {
        let body = r#"{
            "kubernetes_cluster": {
                "id": "do-123",
                "name": "prod",
                "status": {"state": "provisioning", "message": "provisioning"},
                "node_pools": [
                    {"id": "np-1", "name": "pool-a", "size": "s-1vcpu-2gb", "count": 3}
                ]
            }
        }"#;

        let envelope: ClusterEnvelope = serde_json::from_str(body).unwrap();
        let submission = Submission::from(envelope.kubernetes_cluster);

        assert_eq!(submission.external_id, "do-123");
        assert_eq!(submission.status.state, "provisioning");
        assert_eq!(submission.node_pool_ids.get("pool-a").map(String::as_str), Some("np-1"));
    }

    #[test]
    fn credentials_require_access_token() {
        let mut values = BTreeMap::new();
        assert!(DigitalOceanCredentials::from_values(&values).is_err());

        values.insert(ACCESS_TOKEN_KEY.to_string(), String::new());
        assert!(DigitalOceanCredentials::from_values(&values).is_err());

        values.insert(ACCESS_TOKEN_KEY.to_string(), "dop_v1_secret".to_string());
        let credentials = DigitalOceanCredentials::from_values(&values).unwrap();
        assert!(!format!("{credentials:?}").contains("dop_v1_secret"));
    }

    #[test]
    fn urls_are_rooted_at_the_clusters_collection() {
        let gateway = DigitalOceanGateway::with_base_url(
            "http://localhost:8080/",
            DigitalOceanCredentials::new("token"),
        )
        .unwrap();

        assert_eq!(
            gateway.url("/do-123/kubeconfig"),
            "http://localhost:8080/v2/kubernetes/clusters/do-123/kubeconfig"
        );
    }
}
