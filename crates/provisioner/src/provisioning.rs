use std::sync::Arc;

use provider_gateway::{GatewayError, ProviderGateway, ProviderStatus};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    api::ClusterSpec,
    config::ProvisionerConfig,
    model::{ClusterRecord, ClusterStatus},
    reconcilers::node_pools::reconcile_node_pools,
    store::RecordStore,
};

/// How a provisioning run ended. The record is the last one persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready(ClusterRecord),
    Failed {
        record: ClusterRecord,
        retryable: bool,
    },
    /// Stopped by the caller; the record can be resumed.
    Cancelled(ClusterRecord),
}

impl Outcome {
    pub fn record(&self) -> &ClusterRecord {
        match self {
            Outcome::Ready(record) | Outcome::Cancelled(record) => record,
            Outcome::Failed { record, .. } => record,
        }
    }
}

enum Observation {
    Ready,
    Failed,
    Pending,
}

/// Drives a cluster from `Requested` to `Ready` or `Failed`.
///
/// Every transition is a single save. The in-memory record only moves
/// forward once that save succeeded, so a store error leaves the caller
/// with the last persisted state.
pub struct Provisioner<G: ?Sized, S: ?Sized> {
    gateway: Arc<G>,
    store: Arc<S>,
    config: ProvisionerConfig,
}

impl<G, S> Provisioner<G, S>
where
    G: ProviderGateway + ?Sized,
    S: RecordStore + ?Sized,
{
    pub fn new(gateway: Arc<G>, store: Arc<S>, config: ProvisionerConfig) -> Self {
        Self {
            gateway,
            store,
            config,
        }
    }

    #[instrument(level = Level::INFO, skip_all, fields(cluster = %record.id, name = %spec.name))]
    pub async fn create(
        &self,
        mut record: ClusterRecord,
        spec: &ClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        spec.validate_spec()?;

        let pools = reconcile_node_pools(&record.node_pools, &spec.node_pools, spec.creator_id)?
            .into_records();

        if owns_remote_cluster(&record) {
            return Err(Error::AlreadyProvisioning(record.id));
        }
        match self.store.find_by_id(record.id).await {
            Ok(existing) if owns_remote_cluster(&existing) => {
                return Err(Error::AlreadyProvisioning(record.id));
            }
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut next = record.transition(ClusterStatus::Submitting, "submitting cluster to provider");
        next.node_pools = pools;
        self.persist(&mut record, next).await?;

        info!(node_pools = record.node_pools.len(), "Submitting cluster");

        let submission = match self.gateway.submit_create(&record.create_request()).await {
            Ok(submission) => submission,
            Err(err) => return self.fail(record, &err).await,
        };

        let mut next = record.transition(ClusterStatus::Provisioning, submission.status.describe());
        next.external_id = Some(submission.external_id.clone());
        for pool in &mut next.node_pools {
            if let Some(id) = submission.node_pool_ids.get(&pool.name) {
                pool.external_id = Some(id.clone());
            }
        }
        self.persist(&mut record, next).await?;

        info!(external_id = %submission.external_id, "Cluster accepted by provider");

        match self.observe(&submission.status) {
            Observation::Pending => self.poll_until_terminal(record, cancel).await,
            _ => self.settle(record, &submission.status).await,
        }
    }

    /// Continue a run from the persisted record alone, e.g. after a restart.
    #[instrument(level = Level::INFO, skip(self, cancel))]
    pub async fn resume(&self, id: Uuid, cancel: &CancellationToken) -> Result<Outcome> {
        let record = self.store.find_by_id(id).await?;

        match record.status {
            ClusterStatus::Requested => Err(Error::NotStarted(id)),
            ClusterStatus::Ready => Ok(Outcome::Ready(record)),
            // Gave up polling after a provider outage; the remote cluster may still come up
            ClusterStatus::Failed if record.retryable && record.external_id.is_some() => {
                let mut record = record;
                let next = record.transition(ClusterStatus::Provisioning, "resuming status checks");
                self.persist(&mut record, next).await?;
                info!("Resuming status polling of failed cluster");
                self.poll_until_terminal(record, cancel).await
            }
            ClusterStatus::Failed => Ok(Outcome::Failed {
                retryable: record.retryable,
                record,
            }),
            ClusterStatus::Submitting | ClusterStatus::Provisioning
                if record.external_id.is_some() =>
            {
                info!(status = %record.status, "Resuming status polling");
                self.poll_until_terminal(record, cancel).await
            }
            ClusterStatus::Submitting | ClusterStatus::Provisioning => {
                // Interrupted before the provider acknowledged the create call
                let mut record = record;
                let mut next = record.transition(
                    ClusterStatus::Failed,
                    "submission was interrupted before the provider acknowledged it",
                );
                next.retryable = true;
                self.persist(&mut record, next).await?;
                Ok(Outcome::Failed {
                    record,
                    retryable: true,
                })
            }
        }
    }

    /// Delete the remote cluster, then the local record.
    ///
    /// A remote cluster that no longer exists counts as deleted.
    #[instrument(level = Level::INFO, skip_all, fields(cluster = %record.id))]
    pub async fn delete(&self, record: &ClusterRecord) -> Result<()> {
        if let Some(external_id) = record.external_id.as_deref() {
            match self.gateway.delete_cluster(external_id).await {
                Ok(()) => info!(external_id, "Deleted remote cluster"),
                Err(GatewayError::NotFound(_)) => {
                    info!(external_id, "Remote cluster already absent")
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.store.delete(record).await
    }

    pub async fn kubeconfig(&self, record: &ClusterRecord) -> Result<Vec<u8>> {
        let external_id = match (record.status, record.external_id.as_deref()) {
            (ClusterStatus::Ready, Some(id)) => id,
            _ => return Err(Error::NotReady(record.id)),
        };

        Ok(self.gateway.fetch_kubeconfig(external_id).await?)
    }

    async fn poll_until_terminal(
        &self,
        mut record: ClusterRecord,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let external_id = record.external_id.clone().ok_or(Error::MissingField)?;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(status = %record.status, "Provisioning cancelled");
                    return Ok(Outcome::Cancelled(record));
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }

            let status = match self.gateway.fetch_status(&external_id).await {
                Ok(status) => status,
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    warn!(failures, error = %err, "Status check failed");

                    if failures >= self.config.max_consecutive_failures {
                        let mut next = record.transition(
                            ClusterStatus::Failed,
                            format!(
                                "provider unreachable after {failures} consecutive status checks: {}",
                                err.message()
                            ),
                        );
                        next.retryable = true;
                        self.persist(&mut record, next).await?;
                        return Ok(Outcome::Failed {
                            record,
                            retryable: true,
                        });
                    }
                    continue;
                }
                Err(err) => return self.fail(record, &err).await,
            };
            failures = 0;

            match self.observe(&status) {
                Observation::Pending => {
                    debug!(state = %status.state, "Cluster still provisioning");
                    let next = record.transition(ClusterStatus::Provisioning, status.describe());
                    self.persist(&mut record, next).await?;
                }
                _ => return self.settle(record, &status).await,
            }
        }
    }

    fn observe(&self, status: &ProviderStatus) -> Observation {
        if self.config.is_ready_state(&status.state) {
            Observation::Ready
        } else if self.config.is_failed_state(&status.state) {
            Observation::Failed
        } else {
            Observation::Pending
        }
    }

    /// Persist a terminal provider state.
    async fn settle(&self, mut record: ClusterRecord, status: &ProviderStatus) -> Result<Outcome> {
        match self.observe(status) {
            Observation::Ready => {
                let mut next = record.transition(ClusterStatus::Ready, status.describe());
                next.endpoint = status.endpoint.clone();
                next.ipv4 = status.ipv4.clone();
                self.persist(&mut record, next).await?;
                info!(endpoint = ?record.endpoint, "Cluster ready");
                Ok(Outcome::Ready(record))
            }
            Observation::Failed | Observation::Pending => {
                let next = record.transition(ClusterStatus::Failed, status.describe());
                self.persist(&mut record, next).await?;
                warn!(state = %status.state, message = %record.status_message, "Cluster failed");
                Ok(Outcome::Failed {
                    record,
                    retryable: false,
                })
            }
        }
    }

    async fn fail(&self, mut record: ClusterRecord, err: &GatewayError) -> Result<Outcome> {
        let retryable = err.is_retryable();
        let mut next = record.transition(ClusterStatus::Failed, err.message());
        next.retryable = retryable;
        self.persist(&mut record, next).await?;

        warn!(retryable, error = %err, "Provisioning failed");
        Ok(Outcome::Failed { record, retryable })
    }

    async fn persist(&self, record: &mut ClusterRecord, next: ClusterRecord) -> Result<()> {
        self.store.save(&next).await?;
        *record = next;
        Ok(())
    }
}

/// The record already stands for a cluster on the provider side.
fn owns_remote_cluster(record: &ClusterRecord) -> bool {
    record.status.is_active() || record.status == ClusterStatus::Ready || record.external_id.is_some()
}
