//! Hodei Run Controller - Main Entry Point
//!
//! Drives JobRun resources through the worker Pod lifecycle across the
//! configured target clusters.

mod web;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hodei_run_controller::clock::SystemClock;
use hodei_run_controller::demux::LabelSelector;
use hodei_run_controller::metrics::ControllerMetrics;
use hodei_run_controller::pod_view::{ClusterViews, KubePodView, PodView};
use hodei_run_controller::store::ApiJobRunStore;
use hodei_run_controller::tot::HttpBuildIdMinter;
use hodei_run_controller::{Reconciler, Runner};
use hodei_run_crd::JobRun;
use hodei_run_shared::{ClusterConfig, ConfigLoader};
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Hodei Run Controller
#[derive(Parser, Debug)]
#[command(name = "hodei-run-controller")]
#[command(author = "Hodei Team")]
#[command(version = "0.1.0")]
#[command(about = "Execution controller for Hodei JobRuns", long_about = None)]
struct Args {
    /// Path to the controller configuration YAML
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Base URL of the build-id (tot) service
    #[arg(long, default_value = "http://hodei-tot:8888")]
    pub tot_url: String,

    /// Port for the health and metrics endpoints
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("Starting Hodei Run Controller");

    let config = Arc::new(
        ConfigLoader::new(args.config.clone())
            .load()
            .context("Failed to load controller configuration")?,
    );
    info!(
        job_run_namespace = %config.job_run_namespace,
        pod_namespace = %config.pod_namespace,
        workers = config.worker_count,
        clusters = config.clusters.len(),
        "Controller configuration loaded"
    );

    let pod_selector = LabelSelector::parse(&config.pod_label_selector)
        .map_err(|message| anyhow::anyhow!(message))
        .context("Invalid pod label selector")?;

    // One client per target cluster; the default cluster also hosts the
    // JobRun resources.
    let mut views: HashMap<String, Arc<dyn PodView>> = HashMap::new();
    let mut pod_apis: HashMap<String, Api<Pod>> = HashMap::new();
    let mut default_client: Option<Client> = None;
    for (alias, cluster) in &config.clusters {
        let client = cluster_client(cluster)
            .await
            .with_context(|| format!("Failed to build client for cluster {alias:?}"))?;
        views.insert(
            alias.clone(),
            Arc::new(KubePodView::new(client.clone(), &config.pod_namespace)),
        );
        pod_apis.insert(
            alias.clone(),
            Api::namespaced(client.clone(), &config.pod_namespace),
        );
        if alias == "default" {
            default_client = Some(client);
        }
        info!(cluster = %alias, "Connected to target cluster");
    }
    let default_client = default_client.context("The default cluster alias is missing")?;

    let job_run_api: Api<JobRun> =
        Api::namespaced(default_client.clone(), &config.job_run_namespace);
    let store = Arc::new(ApiJobRunStore::new(
        default_client,
        &config.job_run_namespace,
    ));

    let metrics = ControllerMetrics::new();
    let mut registry = Registry::default();
    metrics.register(&mut registry);

    let reconciler = Arc::new(Reconciler::new(
        store,
        ClusterViews::new(views),
        Arc::new(HttpBuildIdMinter::new(args.tot_url.clone())),
        Arc::clone(&config),
        Arc::new(SystemClock),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = Runner::new(reconciler, metrics, pod_selector, config.worker_count);
    let handles = runner.spawn(job_run_api, pod_apis, shutdown_rx);
    info!(tasks = handles.len(), "Controller started");

    let registry = Arc::new(registry);
    tokio::spawn(async move {
        if let Err(err) = web::start_server(args.metrics_port, registry).await {
            tracing::error!(error = %err, "Metrics server failed");
        }
    });

    info!("Controller is running. Press Ctrl+C to stop.");
    let _ = signal::ctrl_c().await;
    info!("Shutting down controller...");
    let _ = shutdown_tx.send(true);
    futures::future::join_all(handles).await;

    Ok(())
}

async fn cluster_client(cluster: &ClusterConfig) -> Result<Client> {
    let kube_config = match &cluster.kubeconfig_path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig from {}", path.display()))?;
            let options = KubeConfigOptions {
                context: cluster.context.clone(),
                cluster: None,
                user: None,
            };
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .context("Failed to create Kubernetes config")?
        }
        None => Config::infer()
            .await
            .context("Failed to infer Kubernetes config")?,
    };
    Client::try_from(kube_config).context("Failed to create Kubernetes client")
}
