//! Command-line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::info;

use crate::endpoint::AnnotationKeys;
use crate::health::DEFAULT_HEALTH_PORT;

/// Annotations read from pods
pub mod annotations {
    /// IP address to register in the service's Endpoints
    pub const IP: &str = "endpoint.kvm.giantswarm.io/ip";
    /// Name of the service whose Endpoints receive the IP
    pub const SERVICE: &str = "endpoint.kvm.giantswarm.io/service";
}

/// Labels read from pods
pub mod labels {
    /// Presence opts a pod out of reconciliation
    pub const POD_WATCHER: &str = "kvm-operator.giantswarm.io/pod-watcher";
}

/// Name used for the synthetic kubeconfig built from flags
const KUBECONFIG_NAME: &str = "endpoint-operator";

#[derive(Debug, Clone, Parser)]
#[command(name = "endpoint-operator")]
#[command(
    about = "Handles IPs inside of Endpoints based on pod annotations",
    long_about = None,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub kubernetes: KubernetesArgs,

    #[command(flatten)]
    pub annotations: AnnotationArgs,

    /// Interval between full re-lists of pods (seconds, at least 1)
    #[arg(
        long,
        env = "ENDPOINT_OPERATOR_RESYNC_PERIOD_SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub resync_period_secs: u64,

    /// Give up booting after retrying for this long (seconds)
    #[arg(long, env = "ENDPOINT_OPERATOR_BOOT_MAX_ELAPSED_SECS", default_value_t = 300)]
    pub boot_max_elapsed_secs: u64,

    /// Attempts per reconciliation pass before it is reported as failed
    #[arg(long, env = "ENDPOINT_OPERATOR_RESOURCE_RETRIES", default_value_t = 3)]
    pub resource_retries: u32,

    /// Maximum number of passes running at once
    #[arg(long, env = "ENDPOINT_OPERATOR_CONCURRENCY", default_value_t = 4)]
    pub concurrency: usize,

    /// Port for the /healthz and /readyz probes
    #[arg(long, env = "ENDPOINT_OPERATOR_HEALTH_PORT", default_value_t = DEFAULT_HEALTH_PORT)]
    pub health_port: u16,
}

impl Cli {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn boot_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.boot_max_elapsed_secs)
    }
}

/// Connection settings for the Kubernetes API server
#[derive(Debug, Clone, Args)]
pub struct KubernetesArgs {
    /// Address used to connect to Kubernetes. When empty the config is inferred.
    #[arg(long = "kubernetes-address", env = "KUBERNETES_ADDRESS", default_value = "")]
    pub address: String,

    /// Whether to use the in-cluster config to authenticate with Kubernetes
    #[arg(long = "kubernetes-in-cluster", env = "KUBERNETES_IN_CLUSTER")]
    pub in_cluster: bool,

    /// Certificate authority file path to use to authenticate with Kubernetes
    #[arg(long = "kubernetes-tls-ca-file", env = "KUBERNETES_TLS_CA_FILE")]
    pub tls_ca_file: Option<PathBuf>,

    /// Certificate file path to use to authenticate with Kubernetes
    #[arg(long = "kubernetes-tls-crt-file", env = "KUBERNETES_TLS_CRT_FILE")]
    pub tls_crt_file: Option<PathBuf>,

    /// Key file path to use to authenticate with Kubernetes
    #[arg(long = "kubernetes-tls-key-file", env = "KUBERNETES_TLS_KEY_FILE")]
    pub tls_key_file: Option<PathBuf>,
}

impl KubernetesArgs {
    /// Build the kube client configuration
    ///
    /// In-cluster wins over an explicit address. With neither, the usual
    /// kubeconfig / in-cluster inference applies.
    pub async fn client_config(&self) -> Result<kube::Config> {
        if self.in_cluster {
            info!("Using in-cluster Kubernetes config");
            return kube::Config::incluster().context("Failed to load in-cluster config");
        }

        if self.address.is_empty() {
            info!("No Kubernetes address given, inferring config");
            return kube::Config::infer()
                .await
                .context("Failed to infer Kubernetes config");
        }

        info!(address = %self.address, "Using explicit Kubernetes address");
        let kubeconfig = self.kubeconfig()?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("Failed to build config for {}", self.address))
    }

    /// Synthetic kubeconfig pointing at the address and TLS files from flags
    fn kubeconfig(&self) -> Result<Kubeconfig> {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());

        let mut cluster = serde_json::json!({ "server": self.address });
        if let Some(ca) = path(&self.tls_ca_file) {
            cluster["certificate-authority"] = ca.into();
        }

        let mut user = serde_json::json!({});
        if let Some(crt) = path(&self.tls_crt_file) {
            user["client-certificate"] = crt.into();
        }
        if let Some(key) = path(&self.tls_key_file) {
            user["client-key"] = key.into();
        }

        let value = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": KUBECONFIG_NAME, "cluster": cluster }],
            "users": [{ "name": KUBECONFIG_NAME, "user": user }],
            "contexts": [{
                "name": KUBECONFIG_NAME,
                "context": { "cluster": KUBECONFIG_NAME, "user": KUBECONFIG_NAME },
            }],
            "current-context": KUBECONFIG_NAME,
        });

        serde_json::from_value(value).context("Failed to build kubeconfig from flags")
    }
}

/// Keys for the opt-in annotations and the opt-out label
#[derive(Debug, Clone, Args)]
pub struct AnnotationArgs {
    /// Pod annotation holding the IP to register
    #[arg(long, env = "ENDPOINT_OPERATOR_IP_ANNOTATION", default_value = annotations::IP)]
    pub ip_annotation: String,

    /// Pod annotation holding the target service name
    #[arg(long, env = "ENDPOINT_OPERATOR_SERVICE_ANNOTATION", default_value = annotations::SERVICE)]
    pub service_annotation: String,

    /// Pod label that opts a pod out of reconciliation
    #[arg(long, env = "ENDPOINT_OPERATOR_SKIP_LABEL", default_value = labels::POD_WATCHER)]
    pub skip_label: String,
}

impl From<&AnnotationArgs> for AnnotationKeys {
    fn from(args: &AnnotationArgs) -> Self {
        AnnotationKeys {
            ip: args.ip_annotation.clone(),
            service: args.service_annotation.clone(),
            skip_label: args.skip_label.clone(),
        }
    }
}
