use anyhow::Result;
use link_core::{Compiler, Inventory, Metrics, Publisher, Reconciler, Shutdown};
use link_kube::{watch, KubeClusterStatusStore, KubeNodeConfigStore, LinkClient};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod server;

use config::ManagerConfig;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LINK_LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting network-manager...");

    let config = ManagerConfig::load()?;
    info!(
        "Configuration: device mode {}, {} publish workers, resync every {}s",
        config.device_mode, config.publish_workers, config.resync_seconds
    );

    let client = LinkClient::new().await?;
    let inventory = Arc::new(Inventory::new());
    let shutdown = Shutdown::new();
    let metrics = Metrics::new()?;
    info!("Metrics collector initialized");

    let publisher = Arc::new(Publisher::new(
        Arc::new(KubeNodeConfigStore::new(&client)),
        config.retry(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        inventory.clone(),
        Compiler::new(config.compiler()),
        publisher,
        Arc::new(KubeClusterStatusStore::new(&client)),
        metrics.clone(),
        config.reconciler(),
    ));

    let clusters = tokio::spawn(watch(client.clusters(), inventory.clone(), shutdown.clone()));
    let nodes = tokio::spawn(watch(client.cluster_nodes(), inventory.clone(), shutdown.clone()));
    let reconcile = {
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };
    let server = tokio::spawn(server::serve(config.metrics_addr, metrics, shutdown.clone()));

    tokio::select! {
        result = wait_for_signal() => {
            result?;
            info!("Shutdown signal received, exiting...");
        }
        _ = shutdown.wait() => {}
    }
    shutdown.trigger();

    for (name, handle) in [("Cluster watcher", clusters), ("ClusterNode watcher", nodes), ("Reconciler", reconcile)] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }
    match server.await {
        Ok(Err(e)) => error!("Metrics server error: {}", e),
        Err(e) => error!("Metrics server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("network-manager stopped");
    Ok(())
}
