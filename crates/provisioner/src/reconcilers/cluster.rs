use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::Stream;
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        Controller,
        controller::{Action, Error as ControllerError},
        finalizer::{Event, finalizer},
        reflector::ObjectRef,
        watcher,
    },
};
use provider_gateway::DigitalOceanGateway;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, Level, instrument};
use uuid::Uuid;

use crate::{
    Error, Result,
    api::DigitalOceanCluster,
    config::ProvisionerConfig,
    model::{ClusterRecord, ClusterStatus},
    provisioning::Provisioner,
    secret::{KubeSecretResolver, connect_gateway},
    store::KubeStatusStore,
};

const FINALIZER_NAME: &str = "doks.dev/cluster-cleanup";

struct ReconcilerCtx {
    client: Client,
    config: ProvisionerConfig,
    /// In-flight provisioning workers, keyed by resource uid.
    workers: DashMap<String, Worker>,
}

#[derive(Clone)]
struct Worker {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

enum Job {
    Create,
    Resume,
}

pub fn control_loop(
    client: Client,
    config: ProvisionerConfig,
) -> impl Stream<
    Item = Result<(ObjectRef<DigitalOceanCluster>, Action), ControllerError<Error, watcher::Error>>,
> {
    let clusters = Api::<DigitalOceanCluster>::all(client.clone());

    let context = Arc::new(ReconcilerCtx {
        client,
        config,
        workers: DashMap::new(),
    });

    Controller::new(clusters, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

#[instrument(level = Level::DEBUG, skip(cluster, context), fields(cluster = %cluster.name_any()))]
async fn reconcile(
    cluster: Arc<DigitalOceanCluster>,
    context: Arc<ReconcilerCtx>,
) -> Result<Action> {
    let namespace = cluster.namespace().ok_or(Error::MissingField)?;
    let clusters = Api::<DigitalOceanCluster>::namespaced(context.client.clone(), &namespace);

    finalizer(&clusters, FINALIZER_NAME, cluster, |event| async move {
        match event {
            Event::Apply(cluster) => apply(cluster, context).await,
            Event::Cleanup(cluster) => cleanup(cluster, context).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

async fn apply(cluster: Arc<DigitalOceanCluster>, context: Arc<ReconcilerCtx>) -> Result<Action> {
    let uid = cluster.uid().ok_or(Error::MissingField)?;

    if context.workers.contains_key(&uid) {
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    let (status, resumable) = cluster
        .status
        .as_ref()
        .map(|r| (r.status, r.retryable && r.external_id.is_some()))
        .unwrap_or_default();

    let job = match status {
        ClusterStatus::Requested => Job::Create,
        ClusterStatus::Submitting | ClusterStatus::Provisioning => Job::Resume,
        ClusterStatus::Failed if resumable => Job::Resume,
        // Other failures are only retried when someone resets them to Requested
        ClusterStatus::Ready | ClusterStatus::Failed => {
            return Ok(Action::requeue(Duration::from_secs(300)));
        }
    };

    let record = match cluster.status.clone() {
        Some(record) => record,
        None => {
            let id = Uuid::parse_str(&uid).map_err(|_| Error::MissingField)?;
            ClusterRecord::new(id, &cluster.spec)
        }
    };

    let provisioner = provisioner_for(&cluster, &context).await?;
    let worker = Worker {
        cancel: CancellationToken::new(),
        tasks: TaskTracker::new(),
    };
    context.workers.insert(uid.clone(), worker.clone());

    let spec = cluster.spec.clone();
    let ctx = Arc::clone(&context);
    let span = tracing::info_span!("provision", cluster = %cluster.name_any(), uid = %uid);

    let cancel = worker.cancel;
    worker.tasks.spawn(
        async move {
            scopeguard::defer!(
                ctx.workers.remove(&uid);
            );

            let result = match job {
                Job::Create => provisioner.create(record, &spec, &cancel).await,
                Job::Resume => provisioner.resume(record.id, &cancel).await,
            };

            match result {
                Ok(outcome) => tracing::info!(
                    status = %outcome.record().status,
                    "Provisioning worker finished"
                ),
                Err(e) => tracing::error!("Provisioning worker failed: {:?}", e),
            }
        }
        .instrument(span),
    );
    worker.tasks.close();

    Ok(Action::requeue(Duration::from_secs(30)))
}

async fn cleanup(cluster: Arc<DigitalOceanCluster>, context: Arc<ReconcilerCtx>) -> Result<Action> {
    let uid = cluster.uid().ok_or(Error::MissingField)?;
    let namespace = cluster.namespace().ok_or(Error::MissingField)?;

    stop_worker(&context.workers, &uid).await;

    // Re-read: a worker may have saved since this snapshot was taken
    let clusters = Api::<DigitalOceanCluster>::namespaced(context.client.clone(), &namespace);
    let Some(record) = clusters.get_status(&cluster.name_any()).await?.status else {
        return Ok(Action::await_change());
    };

    provisioner_for(&cluster, &context)
        .await?
        .delete(&record)
        .await?;

    Ok(Action::await_change())
}

/// Cancel the worker of `uid`, if any, and wait until it has exited.
async fn stop_worker(workers: &DashMap<String, Worker>, uid: &str) {
    let Some(worker) = workers.get(uid).map(|w| w.value().clone()) else {
        return;
    };

    tracing::info!("Cancelling in-flight provisioning");
    worker.cancel.cancel();

    // The worker stops at its next wait point, after its last save
    worker.tasks.wait().await;
}

async fn provisioner_for(
    cluster: &DigitalOceanCluster,
    context: &ReconcilerCtx,
) -> Result<Provisioner<DigitalOceanGateway, KubeStatusStore>> {
    let namespace = cluster.namespace().ok_or(Error::MissingField)?;

    let secrets = KubeSecretResolver::new(context.client.clone(), &namespace);
    let gateway = connect_gateway(&secrets, &cluster.spec.secret_id, &context.config.api_url).await?;
    let store = KubeStatusStore::new(context.client.clone(), &namespace, &cluster.name_any());

    Ok(Provisioner::new(
        Arc::new(gateway),
        Arc::new(store),
        context.config.clone(),
    ))
}

fn error_policy(
    _object: Arc<DigitalOceanCluster>,
    error: &Error,
    _context: Arc<ReconcilerCtx>,
) -> Action {
    tracing::warn!("Reconcile failed, retrying: {}", error);
    Action::requeue(Duration::from_secs(10))
}
