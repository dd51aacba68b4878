// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! csi-attacher - CSI external attacher controller in Rust
//!
//! Watches `VolumeAttachment` objects and attaches or detaches CSI
//! volumes to nodes by calling the driver's controller service.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::Api;
use kube::runtime::watcher;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use csi_attacher::api_store::ApiStore;
use csi_attacher::config::AttacherConfig;
use csi_attacher::controller::AttachDetachController;
use csi_attacher::csi::UdsCsiClient;
use csi_attacher::handler::CsiHandler;
use csi_attacher::health::{HealthServer, Readiness};
use csi_attacher::store::ObjectStore;

/// CSI external attacher
///
/// The external attacher is a sidecar controller for CSI drivers. It
/// watches the shared state of the cluster through the apiserver and
/// attaches or detaches volumes to nodes by calling the driver,
/// recording the outcome in the `VolumeAttachment` status.
#[derive(Parser, Debug)]
#[command(name = "csi-attacher")]
#[command(author = "Kubernetes Authors")]
#[command(version = "0.1.0")]
#[command(about = "CSI external attacher controller", long_about = None)]
struct Args {
    /// Name of the CSI driver to serve
    #[arg(long)]
    driver: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long, global = true)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Path of the CSI driver's Unix domain socket
    #[arg(long)]
    csi_address: Option<PathBuf>,

    /// Number of concurrent attachment workers
    #[arg(long)]
    worker_count: Option<usize>,

    /// Interval between full re-syncs of all attachments
    #[arg(long, value_parser = parse_duration)]
    resync_interval: Option<Duration>,

    /// The address to serve health checks
    #[arg(long)]
    healthz_bind_address: Option<String>,

    /// Port for the health check server
    #[arg(long)]
    healthz_bind_port: Option<u16>,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json);

    info!("starting csi-attacher");

    let config = load_config(args).await?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    info!(
        driver = %config.driver,
        csi_address = %config.csi_address.display(),
        workers = config.worker_count,
        "configuration loaded"
    );

    let client = create_client(&config).await?;

    let store: Arc<dyn ObjectStore> = Arc::new(ApiStore::new(client.clone()));
    let csi = Arc::new(UdsCsiClient::new(config.csi_address.clone()));
    let handler = Arc::new(CsiHandler::new(
        config.driver.clone(),
        Arc::clone(&store),
        csi,
        config.retry.clone(),
    ));
    let controller = Arc::new(AttachDetachController::new(
        config.clone(),
        store,
        handler,
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            cancel.cancel();
        });
    }

    let readiness = Readiness::new();
    let health_addr: SocketAddr = format!(
        "{}:{}",
        config.healthz_bind_address, config.healthz_bind_port
    )
    .parse()
    .context("invalid health bind address")?;
    let health = HealthServer::new(health_addr, readiness.clone());
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = health.run(cancel).await {
                error!("health server failed: {:#}", e);
            }
        });
    }

    tokio::spawn(watch_attachments(
        client.clone(),
        Arc::clone(&controller),
        readiness,
        cancel.clone(),
    ));
    tokio::spawn(watch_volumes(
        client,
        Arc::clone(&controller),
        cancel.clone(),
    ));

    controller.run(cancel).await;

    info!("csi-attacher exited successfully");
    Ok(())
}

/// Feeds `VolumeAttachment` watch events into the controller.
async fn watch_attachments(
    client: kube::Client,
    controller: Arc<AttachDetachController>,
    readiness: Readiness,
    cancel: CancellationToken,
) {
    let api: Api<VolumeAttachment> = Api::all(client);
    let mut stream = pin!(watcher(api, watcher::Config::default()));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.try_next() => match event {
                Ok(Some(event)) => {
                    if controller.handle_attachment_event(event) {
                        readiness.set_ready();
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "attachment watch error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Feeds `PersistentVolume` watch events into the controller. Deletes
/// need no handling: a deleted volume has no finalizer left to reclaim.
async fn watch_volumes(
    client: kube::Client,
    controller: Arc<AttachDetachController>,
    cancel: CancellationToken,
) {
    let api: Api<PersistentVolume> = Api::all(client);
    let mut stream = pin!(watcher(api, watcher::Config::default()));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.try_next() => match event {
                Ok(Some(event)) => controller.handle_volume_event(event),
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "volume watch error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.parse().unwrap_or_default())
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

/// Loads the configuration from file or command-line arguments.
async fn load_config(mut args: Args) -> anyhow::Result<AttacherConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<AttacherConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        AttacherConfig::default()
    };

    // Command-line arguments win over the file.
    if let Some(driver) = args.driver {
        config.driver = driver;
    }
    if let Some(kubeconfig) = args.kubeconfig {
        config.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.master = Some(master);
    }
    if let Some(csi_address) = args.csi_address {
        config.csi_address = csi_address;
    }
    if let Some(worker_count) = args.worker_count {
        config.worker_count = worker_count;
    }
    if let Some(resync_interval) = args.resync_interval {
        config.resync_interval = resync_interval;
    }
    if let Some(address) = args.healthz_bind_address {
        config.healthz_bind_address = address;
    }
    if let Some(port) = args.healthz_bind_port {
        config.healthz_bind_port = port;
    }

    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &AttacherConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &config.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    Ok(kube::Client::try_from(kube_config)?)
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl-C, shutting down");
    }
}
