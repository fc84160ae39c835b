use async_trait::async_trait;
use dashmap::DashMap;
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
};
use serde_json::json;
use tracing::{Level, instrument};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result, api::DigitalOceanCluster, model::ClusterRecord};

/// Persistence for cluster records.
///
/// `save` replaces the record, node pools included, as a single write.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, record: &ClusterRecord) -> Result<()>;

    async fn delete(&self, record: &ClusterRecord) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<ClusterRecord>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<Uuid, ClusterRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save(&self, record: &ClusterRecord) -> Result<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete(&self, record: &ClusterRecord) -> Result<()> {
        self.records.remove(&record.id);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<ClusterRecord> {
        self.records
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(Error::NotFound(id))
    }
}

/// Keeps the record in the status subresource of one `DigitalOceanCluster`.
#[derive(Clone)]
pub struct KubeStatusStore {
    api: Api<DigitalOceanCluster>,
    name: String,
}

impl KubeStatusStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl RecordStore for KubeStatusStore {
    #[instrument(level = Level::DEBUG, skip(self, record), fields(cluster = %record.id, status = %record.status))]
    async fn save(&self, record: &ClusterRecord) -> Result<()> {
        self.api
            .patch_status(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": record })),
            )
            .await?;
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip(self, record), fields(cluster = %record.id))]
    async fn delete(&self, record: &ClusterRecord) -> Result<()> {
        match self
            .api
            .patch_status(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": null })),
            )
            .await
        {
            Ok(_) => Ok(()),
            // The resource itself is gone, and the record with it
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<ClusterRecord> {
        let cluster = match self.api.get_status(&self.name).await {
            Ok(cluster) => cluster,
            Err(kube::Error::Api(e)) if e.code == 404 => return Err(Error::NotFound(id)),
            Err(e) => return Err(e.into()),
        };

        cluster
            .status
            .filter(|record| record.id == id)
            .ok_or(Error::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClusterSpec, NodePoolSpec};

    fn record() -> ClusterRecord {
        let spec = ClusterSpec {
            name: "prod".to_string(),
            region: "nyc1".to_string(),
            version: "1.33".to_string(),
            organization_id: 1,
            creator_id: 1,
            secret_id: "do-token".to_string(),
            node_pools: [(
                "pool-a".to_string(),
                NodePoolSpec {
                    size: "s-1vcpu-2gb".to_string(),
                    count: 1,
                    tags: vec![],
                },
            )]
            .into(),
            tags: vec![],
        };
        ClusterRecord::new(Uuid::new_v4(), &spec)
    }

    #[tokio::test]
    async fn memory_store_save_replaces_and_delete_removes() {
        let store = MemoryStore::new();
        let mut rec = record();

        store.save(&rec).await.unwrap();
        rec.status_message = "second write".to_string();
        store.save(&rec).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.find_by_id(rec.id).await.unwrap().status_message,
            "second write"
        );

        store.delete(&rec).await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.find_by_id(rec.id).await,
            Err(Error::NotFound(id)) if id == rec.id
        ));
    }

    #[tokio::test]
    async fn deleting_missing_record_is_not_an_error() {
        let store = MemoryStore::new();
        assert!(store.delete(&record()).await.is_ok());
    }
}
