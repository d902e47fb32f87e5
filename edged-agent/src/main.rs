//! edged-agent: edge-device supervisor.
//!
//! This daemon runs on each edge device and:
//! - Polls the control plane for the device's target manifest
//! - Reconciles local container services against the declared set
//! - Reconciles Modbus sensor pollers against the declared set
//! - Persists applied state so a restart never re-applies work

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod adapters;
mod agent;
mod manifest;
mod modbus;
mod store;
mod supplier;

use edged_reconciler::{spawn, Engine, PlanPolicy};

use adapters::{SensorAdapter, ServiceAdapter};
use agent::Supervisor;
use manifest::{SENSOR_KIND, SERVICE_KIND};
use store::SqliteStore;
use supplier::HttpSupplier;

/// edged Agent
#[derive(Parser, Debug)]
#[command(name = "edged-agent", version, about)]
struct Args {
    /// Control-plane API endpoint (e.g., http://controller:8080)
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api_endpoint: String,

    /// Device name used in API paths (defaults to hostname)
    #[arg(long)]
    device_name: Option<String>,

    /// Data directory for the state database and container bundles
    #[arg(long, default_value = "/var/lib/edged")]
    data_dir: PathBuf,

    /// Target poll interval in seconds
    #[arg(long, default_value = "10")]
    poll_interval: u64,

    /// OCI runtime binary used for container services
    #[arg(long, default_value = "/usr/bin/youki")]
    runtime_path: PathBuf,

    /// Poll and reconcile once, then exit
    #[arg(long)]
    oneshot: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edged_agent=info,edged_reconciler=info,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let device_name = args.device_name.unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    info!("Starting edged-agent: {}", device_name);
    info!("Control plane: {}", args.api_endpoint);

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .context("Failed to create data directory")?;

    let store = Arc::new(
        SqliteStore::new(&args.data_dir)
            .await
            .context("Failed to open state database")?,
    );

    let service_adapter = Arc::new(ServiceAdapter::new(
        args.runtime_path,
        args.data_dir.join("bundles"),
    ));
    let sensor_adapter = Arc::new(SensorAdapter::new());

    let services = spawn(
        Engine::load(
            SERVICE_KIND,
            service_adapter,
            store.clone(),
            PlanPolicy::default(),
        )
        .await,
    );
    let sensors = spawn(Engine::load(SENSOR_KIND, sensor_adapter, store, PlanPolicy::default()).await);

    let supplier = HttpSupplier::new(&args.api_endpoint, &device_name);
    let mut supervisor = Supervisor::new(
        Box::new(supplier),
        services,
        sensors,
        Duration::from_secs(args.poll_interval),
    );

    if args.oneshot {
        return supervisor.poll_once().await;
    }

    tokio::select! {
        result = supervisor.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received ctrl-c, shutting down");
            Ok(())
        }
    }
}
