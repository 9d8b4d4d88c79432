//! Spindle integration test harness.
//!
//! Every test builds its own tree on loopback: a dispatcher, optionally one
//! or more relays, and worker clients. Nothing is shared between tests, so
//! they run in parallel.
//!
//!   cargo test --test integration

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use spindle_core::work::items_from_json;
use spindle_services::{ChannelOptions, DispatchQueue, Dispatcher, RelayNode, RelayOptions, WorkerClient};

mod dispatch;
mod relay;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Per-request budget on the worker side. Comfortably above any relay
/// retry budget used below.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DispatcherHandle {
    pub addr: String,
    pub queue: Arc<DispatchQueue>,
    pub shutdown: broadcast::Sender<()>,
    pub task: JoinHandle<Result<()>>,
}

pub struct RelayHandle {
    pub addr: String,
    pub node: Arc<RelayNode>,
    pub task: JoinHandle<Result<()>>,
}

/// Start a dispatcher over `items` on an ephemeral loopback port.
pub async fn spawn_dispatcher(items: Value) -> Result<DispatcherHandle> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    spawn_dispatcher_on(listener, items)
}

/// Start a dispatcher on a listener the caller already bound.
pub fn spawn_dispatcher_on(listener: TcpListener, items: Value) -> Result<DispatcherHandle> {
    let addr = listener.local_addr()?.to_string();
    let queue = Arc::new(DispatchQueue::new(items_from_json(items)?)?);
    let (shutdown, rx) = broadcast::channel(1);
    let dispatcher = Dispatcher::new(
        "root",
        listener,
        queue.clone(),
        ChannelOptions::default(),
        Duration::from_millis(500),
        rx,
    );
    let task = tokio::spawn(dispatcher.run());
    Ok(DispatcherHandle {
        addr,
        queue,
        shutdown,
        task,
    })
}

/// Relay tuned for tests: short timeouts, fast sweeps, quick reconnects.
pub fn fast_relay(name: &str, upstream_addr: &str, max_retries: u32) -> RelayOptions {
    RelayOptions {
        name: name.to_string(),
        upstream_addr: upstream_addr.to_string(),
        response_timeout: Duration::from_millis(150),
        retry_sweep: Duration::from_millis(25),
        max_retries,
        heartbeat: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(50),
        channel: ChannelOptions::default(),
    }
}

pub async fn spawn_relay(options: RelayOptions) -> Result<RelayHandle> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let node = RelayNode::new(options);
    let task = tokio::spawn(node.clone().run(listener));
    Ok(RelayHandle { addr, node, task })
}

pub async fn worker(addr: &str, name: &str) -> Result<WorkerClient> {
    WorkerClient::connect(addr, name, ChannelOptions::default(), CLIENT_TIMEOUT)
        .await
        .with_context(|| format!("worker {name} failed to connect to {addr}"))
}

/// A loopback address nobody is listening on (yet).
pub async fn vacant_addr() -> Result<String> {
    let spare = TcpListener::bind("127.0.0.1:0").await?;
    Ok(spare.local_addr()?.to_string())
}

/// Poll `check` every 20ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Harness self-checks ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_relay_reaches_connected_upstream() -> Result<()> {
    let root = spawn_dispatcher(serde_json::json!([])).await?;
    let relay = spawn_relay(fast_relay("r1", &root.addr, 3)).await?;
    eventually(Duration::from_secs(3), "upstream link", || {
        relay.node.upstream_state() == spindle_services::ChannelState::Connected
    })
    .await
}
