use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use provisioner::{
    Error, Result,
    api::{ClusterSpec, NodePoolSpec},
    model::{ClusterRecord, ClusterStatus},
    store::{MemoryStore, RecordStore},
};
use uuid::Uuid;

/// Memory store that remembers every saved status and can refuse a given save.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    history: Mutex<Vec<ClusterStatus>>,
    saves: AtomicUsize,
    fail_on_save: Option<usize>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the `n`th save (1-based).
    pub fn failing_on_save(n: usize) -> Self {
        Self {
            fail_on_save: Some(n),
            ..Self::default()
        }
    }

    pub fn history(&self) -> Vec<ClusterStatus> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for RecordingStore {
    async fn save(&self, record: &ClusterRecord) -> Result<()> {
        let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_save == Some(n) {
            return Err(Error::Store(format!("save #{n} refused")));
        }

        self.history.lock().unwrap().push(record.status);
        self.inner.save(record).await
    }

    async fn delete(&self, record: &ClusterRecord) -> Result<()> {
        self.inner.delete(record).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<ClusterRecord> {
        self.inner.find_by_id(id).await
    }
}

pub fn pool(size: &str, count: i32) -> NodePoolSpec {
    NodePoolSpec {
        size: size.to_string(),
        count,
        tags: vec![],
    }
}

pub fn cluster_spec(node_pools: BTreeMap<String, NodePoolSpec>) -> ClusterSpec {
    ClusterSpec {
        name: "prod".to_string(),
        region: "nyc1".to_string(),
        version: "1.33.1-do.0".to_string(),
        organization_id: 1,
        creator_id: 7,
        secret_id: "do-token".to_string(),
        node_pools,
        tags: vec![],
    }
}
