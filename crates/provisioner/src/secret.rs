use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use provider_gateway::{DigitalOceanCredentials, DigitalOceanGateway};
use tracing::{Level, instrument};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

pub type Credentials = BTreeMap<String, String>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, secret_id: &str) -> Result<Credentials>;
}

/// Resolves credentials once and builds a DigitalOcean client from them.
#[instrument(level = Level::DEBUG, skip(resolver, api_url))]
pub async fn connect_gateway(
    resolver: &dyn SecretResolver,
    secret_id: &str,
    api_url: &str,
) -> Result<DigitalOceanGateway> {
    let values = resolver.resolve(secret_id).await?;
    let credentials = DigitalOceanCredentials::from_values(&values)?;

    Ok(DigitalOceanGateway::with_base_url(api_url, credentials)?)
}

/// Like [`connect_gateway`], but also checks the token with the provider.
#[instrument(level = Level::DEBUG, skip(resolver, api_url))]
pub async fn verify_secret(
    resolver: &dyn SecretResolver,
    secret_id: &str,
    api_url: &str,
) -> Result<DigitalOceanGateway> {
    let gateway = connect_gateway(resolver, secret_id, api_url).await?;
    gateway.verify_credentials().await?;

    Ok(gateway)
}

/// Reads credentials from a Kubernetes `Secret`.
pub struct KubeSecretResolver {
    secrets: Api<Secret>,
}

impl KubeSecretResolver {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            secrets: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl SecretResolver for KubeSecretResolver {
    async fn resolve(&self, secret_id: &str) -> Result<Credentials> {
        let secret = match self.secrets.get(secret_id).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(Error::Secret(format!("secret {secret_id} not found")));
            }
            Err(e) => return Err(e.into()),
        };

        secret_values(secret_id, &secret)
    }
}

fn secret_values(secret_id: &str, secret: &Secret) -> Result<Credentials> {
    let mut values = Credentials::new();

    for (key, value) in secret.data.iter().flatten() {
        let decoded = String::from_utf8(value.0.clone())
            .map_err(|_| Error::Secret(format!("key {key} of secret {secret_id} is not UTF-8")))?;
        values.insert(key.clone(), decoded);
    }
    for (key, value) in secret.string_data.iter().flatten() {
        values.insert(key.clone(), value.clone());
    }

    Ok(values)
}

/// YAML file mapping secret ids to their key/value pairs.
pub struct FileSecretResolver {
    path: PathBuf,
}

impl FileSecretResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretResolver for FileSecretResolver {
    async fn resolve(&self, secret_id: &str) -> Result<Credentials> {
        let data = tokio::fs::read_to_string(&self.path).await?;
        let mut secrets: BTreeMap<String, Credentials> = serde_yaml_ng::from_str(&data)?;

        secrets.remove(secret_id).ok_or_else(|| {
            Error::Secret(format!(
                "secret {secret_id} not found in {}",
                self.path.display()
            ))
        })
    }
}
