//! Drift operator - converges DriftRuntime resources on Kubernetes

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use drift_operator::build::platform::PlatformBuild;
use drift_operator::build::pod::PodBuild;
use drift_operator::build::BuildBackend;
use drift_operator::crd::DriftRuntime;
use drift_operator::pipeline::{CaSecretProvider, Pipeline};
use drift_operator::resources::{KubeInfra, Substrate};
use drift_operator::scheduler::{self, Context};
use drift_operator::wait::WaitParams;
use drift_operator::FIELD_MANAGER;

/// Drift - operator for plugin-extensible runtime deployments
#[derive(Parser, Debug)]
#[command(name = "drift", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Seconds between periodic reconciliations of a healthy runtime
    #[arg(long, env = "DRIFT_REQUEUE_SECONDS", default_value_t = 120)]
    requeue_seconds: u64,

    /// Readiness wait timeout in seconds
    #[arg(long, env = "DRIFT_READINESS_TIMEOUT_SECONDS", default_value_t = 300)]
    readiness_timeout_seconds: u64,

    /// Image build timeout in seconds
    #[arg(long, env = "DRIFT_BUILD_TIMEOUT_SECONDS", default_value_t = 1800)]
    build_timeout_seconds: u64,

    /// Name of the CA secret to copy certificate material from
    #[arg(long, env = "DRIFT_CA_SECRET", default_value = "drift-cluster-ca")]
    ca_secret: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&DriftRuntime::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli).await,
    }
}

/// Install the DriftRuntime CRD on startup
///
/// Server-side apply keeps the installed CRD version in lockstep with the
/// operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing DriftRuntime CRD...");
    crds.patch(
        "driftruntimes.drift.dev",
        &params,
        &Patch::Apply(&DriftRuntime::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install DriftRuntime CRD: {}", e))?;

    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Drift operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let substrate = Substrate::detect(&client).await;
    tracing::info!(substrate = ?substrate, "build backend selected");
    let backend: Arc<dyn BuildBackend> = match substrate {
        Substrate::Kubernetes => Arc::new(PodBuild::new()),
        Substrate::Platform => Arc::new(PlatformBuild::new()),
    };

    let infra = Arc::new(KubeInfra::new(client.clone()));
    let pipeline = Arc::new(Pipeline::new(
        infra.clone(),
        backend,
        Arc::new(CaSecretProvider::new(cli.ca_secret)),
        WaitParams::new(
            Duration::from_secs(2),
            Duration::from_secs(cli.readiness_timeout_seconds),
        ),
        WaitParams::new(
            Duration::from_secs(5),
            Duration::from_secs(cli.build_timeout_seconds),
        ),
    ));

    let ctx = Arc::new(Context {
        infra,
        pipeline,
        requeue_interval: Duration::from_secs(cli.requeue_seconds),
    });

    tracing::info!("Starting DriftRuntime controller");
    scheduler::run(client, ctx).await;

    tracing::info!("Drift operator shutting down");
    Ok(())
}
