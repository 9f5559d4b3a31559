use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use endpoint_operator::client::KubeClusterApi;
use endpoint_operator::config::Cli;
use endpoint_operator::controllers::pod::PodController;
use endpoint_operator::controllers::retry::RetryPolicy;
use endpoint_operator::controllers::ControllerContext;
use endpoint_operator::endpoint::{AnnotationKeys, ReconcileResource};
use endpoint_operator::health::{run_health_server, HealthState};
use endpoint_operator::operator::{BootConfig, Operator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "endpoint-operator starting");

    let kube_config = cli
        .kubernetes
        .client_config()
        .await
        .context("Failed to build Kubernetes client config")?;
    let kube_client =
        Client::try_from(kube_config).context("Failed to create Kubernetes client")?;

    let keys = AnnotationKeys::from(&cli.annotations);
    info!(
        ip_annotation = %keys.ip,
        service_annotation = %keys.service,
        skip_label = %keys.skip_label,
        "Loaded configuration"
    );

    let cluster = Arc::new(KubeClusterApi::new(kube_client.clone()));
    let ctx = Arc::new(ControllerContext {
        resource: ReconcileResource::new(cluster.clone(), keys),
        retry: RetryPolicy::with_max_attempts(cli.resource_retries),
        resync_period: cli.resync_period(),
        concurrency: cli.concurrency.max(1),
    });

    let controller = PodController::new(kube_client, ctx);
    let operator = Operator::new(
        controller,
        BootConfig::with_max_elapsed(cli.boot_max_elapsed()),
    );

    let health = Arc::new(HealthState::new(operator.state(), cluster));
    let health_port = cli.health_port;
    let mut health_server = tokio::spawn(async move {
        if let Err(e) = run_health_server(health, health_port).await {
            error!(error = %e, "Health check server failed");
        }
    });

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    select! {
        _ = operator.boot() => {
            info!("Operator boot returned");
        }
        _ = &mut health_server => {
            anyhow::bail!("Health check server exited unexpectedly");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }

    health_server.abort();
    info!("Shutdown complete");

    Ok(())
}
