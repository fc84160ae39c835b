use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use provisioner::{
    api::{ClusterSpec, DigitalOceanCluster},
    config::ProvisionerConfig,
    model::ClusterRecord,
    provisioning::{Outcome, Provisioner},
    reconcilers,
    secret::{FileSecretResolver, KubeSecretResolver, connect_gateway, verify_secret},
    store::MemoryStore,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    /// YAML file overriding the default provisioner settings
    #[arg(long, global = true, env = "PROVISIONER_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the DigitalOceanCluster reconciliation loop
    Reconcile,
    /// Output K8s manifest for the DigitalOceanCluster CRD
    CrdManifest,
    /// Create a cluster from a spec file and wait until it settles
    Provision(ProvisionArgs),
    /// Write the kubeconfig of a ready cluster to stdout
    Kubeconfig(KubeconfigArgs),
    /// Check that a Kubernetes secret holds a working DigitalOcean token
    VerifySecret(VerifySecretArgs),
}

#[derive(Debug, Clone, Args)]
struct ProvisionArgs {
    /// Cluster spec in YAML
    #[arg(long, short)]
    file: PathBuf,
    /// YAML file mapping secret ids to credentials
    #[arg(long)]
    credentials: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct KubeconfigArgs {
    #[arg(long, short, default_value = "default")]
    namespace: String,
    name: String,
}

#[derive(Debug, Clone, Args)]
struct VerifySecretArgs {
    #[arg(long, short, default_value = "default")]
    namespace: String,
    secret_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env())
        .try_init()?;

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ProvisionerConfig::load(path)
            .await
            .with_context(|| format!("load config from {}", path.display()))?,
        None => ProvisionerConfig::default(),
    };

    match cli.command {
        Some(Commands::Reconcile) => run_controller(config).await?,
        Some(Commands::CrdManifest) => {
            println!("{}", serde_yaml_ng::to_string(&DigitalOceanCluster::crd())?);
        }
        Some(Commands::Provision(args)) => provision(args, config).await?,
        Some(Commands::Kubeconfig(args)) => kubeconfig(args, config).await?,
        Some(Commands::VerifySecret(args)) => {
            let client = Client::try_default().await.context("connect to k8s")?;
            let secrets = KubeSecretResolver::new(client, &args.namespace);
            verify_secret(&secrets, &args.secret_id, &config.api_url).await?;
            tracing::info!(secret = %args.secret_id, "Credentials accepted by provider");
        }
        None => {}
    }

    Ok(())
}

async fn run_controller(config: ProvisionerConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await.context("connect to k8s")?;

    reconcilers::cluster::control_loop(client, config)
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("Reconciled cluster {:?}", o),
                Err(e) => tracing::error!("Cluster reconcile failed: {:?}", e),
            }
        })
        .await;

    tracing::info!("controller terminated");
    Ok(())
}

async fn provision(args: ProvisionArgs, config: ProvisionerConfig) -> anyhow::Result<()> {
    let data = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("read {}", args.file.display()))?;
    let spec: ClusterSpec = serde_yaml_ng::from_str(&data).context("parse cluster spec")?;

    let secrets = FileSecretResolver::new(args.credentials);
    let gateway = verify_secret(&secrets, &spec.secret_id, &config.api_url)
        .await
        .context("verify provider credentials")?;
    let provisioner = Provisioner::new(Arc::new(gateway), Arc::new(MemoryStore::new()), config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping after the current step");
                cancel.cancel();
            }
        }
    });

    let record = ClusterRecord::new(Uuid::new_v4(), &spec);
    let outcome = provisioner.create(record, &spec, &cancel).await?;
    println!("{}", serde_yaml_ng::to_string(outcome.record())?);

    match outcome {
        Outcome::Ready(_) => Ok(()),
        Outcome::Failed { record, retryable } => anyhow::bail!(
            "cluster {} failed (retryable: {}): {}",
            record.name,
            retryable,
            record.status_message
        ),
        Outcome::Cancelled(record) => anyhow::bail!(
            "provisioning of {} cancelled while {}",
            record.name,
            record.status
        ),
    }
}

async fn kubeconfig(args: KubeconfigArgs, config: ProvisionerConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await.context("connect to k8s")?;

    let clusters = Api::<DigitalOceanCluster>::namespaced(client.clone(), &args.namespace);
    let cluster = clusters.get(&args.name).await?;
    let record = cluster
        .status
        .with_context(|| format!("cluster {} has not been provisioned", args.name))?;

    let secrets = KubeSecretResolver::new(client, &args.namespace);
    let gateway = connect_gateway(&secrets, &cluster.spec.secret_id, &config.api_url).await?;
    let provisioner = Provisioner::new(Arc::new(gateway), Arc::new(MemoryStore::new()), config);

    let bytes = provisioner.kubeconfig(&record).await?;
    std::io::stdout().write_all(&bytes)?;
    Ok(())
}
