//! spindled: task dispatch daemon. Runs as the dispatcher (root of the
//! tree, optionally with the HTTP dispatch layer) or as a relay.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use spindle_core::config::{Role, SpindleConfig};
use spindle_core::work::load_items;
use spindle_services::{ChannelOptions, DispatchQueue, Dispatcher, RelayNode, RelayOptions};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SpindleConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SpindleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SpindleConfig::default()
    });

    let role = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<Role>().map_err(anyhow::Error::msg)?,
        None => config.node.role,
    };
    tracing::info!(node = %config.node.name, ?role, "spindled starting");

    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;

    match role {
        Role::Dispatcher => run_dispatcher(config, listener).await,
        Role::Relay => run_relay(config, listener).await,
    }
}

async fn run_dispatcher(config: SpindleConfig, listener: TcpListener) -> Result<()> {
    let path = &config.dispatch.items_path;
    let items = load_items(path).with_context(|| format!("failed to load items from {}", path.display()))?;
    let queue = Arc::new(DispatchQueue::resume(items, config.dispatch.resume_from)?);
    tracing::info!(items = queue.len(), resume_from = config.dispatch.resume_from, "queue ready");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    spawn_ctrl_c(shutdown_tx.clone());

    let dispatcher = Dispatcher::new(
        config.node.name.clone(),
        listener,
        queue.clone(),
        ChannelOptions::from(&config.channel),
        config.relay.heartbeat(),
        shutdown_tx.subscribe(),
    );
    let dispatcher_task = tokio::spawn(dispatcher.run());

    let http_addr = config.network.http_addr.clone();
    let http_task = tokio::spawn(async move {
        if http_addr.is_empty() {
            return std::future::pending::<Result<()>>().await;
        }
        spindle_api::serve(spindle_api::ApiState::new(queue), &http_addr).await
    });

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = http_task => tracing::error!("http layer exited: {:?}", r),
    }

    // The dispatcher saw the same signal; let it finish the shutdown broadcast.
    let _ = shutdown_tx.send(());
    match dispatcher_task.await {
        Ok(result) => result,
        Err(e) => Err(e).context("dispatcher task panicked"),
    }
}

async fn run_relay(config: SpindleConfig, listener: TcpListener) -> Result<()> {
    let relay = RelayNode::new(RelayOptions::from_config(&config));
    spawn_ctrl_c(relay.shutdown_handle());
    relay.run(listener).await
}

fn spawn_ctrl_c(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        let _ = shutdown.send(());
    });
}
