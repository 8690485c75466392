use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, ValueEnum};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tracing::info;

use cluster_lifecycle::accessor::{KubeAccessor, ResourceAccessor, ResourceRegistry};
use cluster_lifecycle::bootstrap::{BootstrapPackage, BootstrapReplicator};
use cluster_lifecycle::cluster::operation::mark_operation_started;
use cluster_lifecycle::cluster::ClusterWaiter;
use cluster_lifecycle::config::{ReplicatorArgs, WaitArgs};
use cluster_lifecycle::crd::Cluster;
use cluster_lifecycle::Error;

#[derive(Parser)]
#[command(name = "cluster-lifecycle")]
#[command(bin_name = "cluster-lifecycle")]
enum ClusterLifecycleCli {
    /// Wait for infrastructure and control plane
    WaitInitialized(WaitCommand),
    /// Wait for the cluster, its machines and optionally its replicas
    WaitReady(WaitReadyArgs),
    /// Wait for the cluster object to go away
    WaitDeleted(WaitCommand),
    WaitControlPlaneAvailable(WaitCommand),
    /// Wait for a kubernetes version update to roll out
    WaitUpgrade(WaitUpgradeArgs),
    WaitManagedUpgrade(WaitManagedUpgradeArgs),
    WaitManagedReady(WaitCommand),
    /// Record the start of an operation on the cluster object
    MarkOperation(MarkOperationArgs),
    /// Clone bootstrap package values into the cluster namespace
    ClonePackages(ClonePackagesArgs),
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct WaitCommand {
    #[arg(short, long)]
    cluster: String,
    #[arg(short, long, default_value = "default")]
    namespace: String,
    #[command(flatten)]
    wait: WaitArgs,
}

#[derive(Args)]
struct WaitReadyArgs {
    #[command(flatten)]
    target: WaitCommand,
    #[arg(long)]
    check_replicas: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum UpgradeMode {
    ControlPlane,
    Workers,
}

#[derive(Args)]
struct WaitUpgradeArgs {
    #[command(flatten)]
    target: WaitCommand,
    #[arg(long)]
    version: String,
    #[arg(long, value_enum, default_value_t = UpgradeMode::ControlPlane)]
    mode: UpgradeMode,
    /// Kubeconfig context of the workload cluster, for its server version
    #[arg(long)]
    workload_context: Option<String>,
}

#[derive(Args)]
struct WaitManagedUpgradeArgs {
    #[command(flatten)]
    target: WaitCommand,
    #[arg(long)]
    version: String,
}

#[derive(Args)]
struct MarkOperationArgs {
    #[arg(short, long)]
    cluster: String,
    #[arg(short, long, default_value = "default")]
    namespace: String,
    #[arg(long)]
    operation: String,
    #[arg(long, default_value_t = 30 * 60)]
    timeout_secs: u64,
}

#[derive(Args)]
struct ClonePackagesArgs {
    #[arg(short, long)]
    cluster: String,
    #[arg(short, long, default_value = "default")]
    namespace: String,
    #[arg(long)]
    source_namespace: String,
    /// YAML list of bootstrap packages
    #[arg(long)]
    packages: PathBuf,
    #[command(flatten)]
    replicator: ReplicatorArgs,
}

fn accessor(client: Client) -> KubeAccessor {
    KubeAccessor::new(client, Arc::new(ResourceRegistry::with_catalog()))
}

async fn workload_accessor(context: &str) -> Result<KubeAccessor, Error> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..KubeConfigOptions::default()
    };
    let config = Config::from_kubeconfig(&options).await?;
    Ok(accessor(Client::try_from(config)?))
}

fn waiter(accessor: KubeAccessor, args: WaitArgs) -> ClusterWaiter<KubeAccessor> {
    ClusterWaiter::new(accessor, args.into())
}

fn read_packages(path: &Path) -> Result<Vec<BootstrapPackage>, Error> {
    let content =
        std::fs::read_to_string(path).map_err(|e| Error::ReadError(path.display().to_string(), e))?;
    Ok(serde_yaml::from_str(&content)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let management = accessor(Client::try_default().await?);

    match ClusterLifecycleCli::parse() {
        ClusterLifecycleCli::WaitInitialized(args) => {
            waiter(management, args.wait)
                .wait_for_cluster_initialized(&args.cluster, &args.namespace)
                .await?
        }
        ClusterLifecycleCli::WaitReady(args) => {
            let target = args.target;
            waiter(management, target.wait)
                .wait_for_cluster_ready(&target.cluster, &target.namespace, args.check_replicas)
                .await?
        }
        ClusterLifecycleCli::WaitDeleted(args) => {
            waiter(management, args.wait)
                .wait_for_cluster_deletion(&args.cluster, &args.namespace)
                .await?
        }
        ClusterLifecycleCli::WaitControlPlaneAvailable(args) => {
            waiter(management, args.wait)
                .wait_for_control_plane_available(&args.cluster, &args.namespace)
                .await?
        }
        ClusterLifecycleCli::WaitUpgrade(args) => {
            let target = args.target;
            let workload = match &args.workload_context {
                Some(context) => Some(workload_accessor(context).await?),
                None => None,
            };
            let waiter = waiter(management, target.wait);
            match args.mode {
                UpgradeMode::ControlPlane => {
                    waiter
                        .wait_k8s_version_update_for_control_plane(
                            &target.cluster,
                            &target.namespace,
                            &args.version,
                            workload.as_ref(),
                        )
                        .await?
                }
                UpgradeMode::Workers => {
                    waiter
                        .wait_k8s_version_update_for_workers(
                            &target.cluster,
                            &target.namespace,
                            &args.version,
                            workload.as_ref(),
                        )
                        .await?
                }
            }
        }
        ClusterLifecycleCli::WaitManagedUpgrade(args) => {
            let target = args.target;
            waiter(management, target.wait)
                .wait_for_managed_cluster_k8s_version_update(&target.cluster, &target.namespace, &args.version)
                .await?
        }
        ClusterLifecycleCli::WaitManagedReady(args) => {
            waiter(management, args.wait)
                .wait_for_managed_cluster_ready(&args.cluster, &args.namespace)
                .await?
        }
        ClusterLifecycleCli::MarkOperation(args) => {
            mark_operation_started(
                &management,
                &args.cluster,
                &args.namespace,
                &args.operation,
                std::time::Duration::from_secs(args.timeout_secs),
            )
            .await?
        }
        ClusterLifecycleCli::ClonePackages(args) => {
            let packages = read_packages(&args.packages)?;
            let cluster: Cluster = management.get_typed(&args.namespace, &args.cluster).await?;
            let replicator = BootstrapReplicator::new(management, args.replicator.into());
            let cloned = replicator
                .clone_referenced_objects_from_packages(&cluster, &packages, &args.source_namespace)
                .await?;
            info!(
                secrets = cloned.secrets.len(),
                providers = cloned.providers.len(),
                embedded = cloned.embedded.len(),
                "cloned bootstrap package values"
            );
            println!("{}", serde_yaml::to_string(&cloned.packages)?);
        }
    };

    Ok(())
}
