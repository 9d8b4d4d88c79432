//! Relay node: fans many downstream channels into one upstream channel.
//!
//! Task layout:
//!
//!   accept loop        one channel per downstream connection; its default
//!                      handler pushes requests onto the relay queue (FIFO)
//!   forward loop       single consumer of the relay queue; annotates,
//!                      records a pending entry, sends upstream
//!   outbound loop      delivers responses, fan-outs and failures downstream
//!   upstream link      dial, reconnect, route upstream traffic (upstream.rs)
//!   sweeps             retry and heartbeat (sweep.rs)
//!
//! Lock order: `downstream` before `pending`. No lock is held across an
//! await.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};

use spindle_core::config::SpindleConfig;
use spindle_core::wire;
use spindle_core::work::{RegisterAck, RegisterRequest, StatusReport, WorkerPresence};
use spindle_core::{Envelope, MessageKind};

use super::pending::{PendingRelayEntry, PendingTable};
use crate::channel::{ChannelId, ChannelOptions, ChannelState, FramedChannel};
use crate::handlers::{HandlerError, HandlerTable, Reply};
use crate::lock;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub name: String,
    pub upstream_addr: String,
    pub response_timeout: Duration,
    pub retry_sweep: Duration,
    /// Resends allowed before the downstream gets `relay_failure`.
    pub max_retries: u32,
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
    pub channel: ChannelOptions,
}

impl RelayOptions {
    pub fn from_config(config: &SpindleConfig) -> Self {
        Self {
            name: config.node.name.clone(),
            upstream_addr: config.network.upstream_addr.clone(),
            response_timeout: config.relay.response_timeout(),
            retry_sweep: config.relay.retry_sweep(),
            max_retries: config.relay.max_retries,
            heartbeat: config.relay.heartbeat(),
            reconnect_delay: config.relay.reconnect_delay(),
            channel: ChannelOptions::from(&config.channel),
        }
    }
}

pub(super) struct Downstream {
    pub(super) channel: FramedChannel,
    /// Name from the registration handshake, if any.
    pub(super) worker: Option<String>,
}

/// A downstream request waiting for the forward loop.
pub(super) struct Relayed {
    envelope: Envelope,
    origin: ChannelId,
}

pub(super) enum Outbound {
    Deliver { downstream: ChannelId, envelope: Envelope },
    /// Queued after a shutdown fan-out so the fan-out goes first.
    Stop,
}

pub struct RelayNode {
    pub(super) options: RelayOptions,
    pub(super) downstream: Mutex<HashMap<ChannelId, Downstream>>,
    pub(super) pending: Mutex<PendingTable>,
    pub(super) upstream: Mutex<Option<FramedChannel>>,
    pub(super) upstream_state: watch::Sender<ChannelState>,
    relay_tx: mpsc::UnboundedSender<Relayed>,
    relay_rx: Mutex<Option<mpsc::UnboundedReceiver<Relayed>>>,
    pub(super) outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    pub(super) shutdown: broadcast::Sender<()>,
}

impl RelayNode {
    pub fn new(options: RelayOptions) -> Arc<Self> {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(4);
        let (upstream_state, _) = watch::channel(ChannelState::Idle);
        Arc::new(Self {
            options,
            downstream: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingTable::new()),
            upstream: Mutex::new(None),
            upstream_state,
            relay_tx,
            relay_rx: Mutex::new(Some(relay_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Handle for stopping the relay from outside.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn upstream_state(&self) -> ChannelState {
        *self.upstream_state.borrow()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn downstream_count(&self) -> usize {
        lock(&self.downstream).len()
    }

    pub(super) fn upstream(&self) -> Option<FramedChannel> {
        lock(&self.upstream).clone().filter(|ch| ch.is_connected())
    }

    /// Run until shutdown. Accepts downstream connections on `listener`.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let relay_rx = lock(&self.relay_rx).take().context("relay already running")?;
        let outbound_rx = lock(&self.outbound_rx).take().context("relay already running")?;
        let mut shutdown = self.shutdown.subscribe();

        tracing::info!(
            relay = %self.options.name,
            addr = ?listener.local_addr().ok(),
            upstream = %self.options.upstream_addr,
            "relay listening"
        );

        let tasks = vec![
            tokio::spawn(self.clone().upstream_supervisor(self.shutdown.subscribe())),
            tokio::spawn(self.clone().forward_loop(relay_rx, self.shutdown.subscribe())),
            tokio::spawn(self.clone().outbound_loop(outbound_rx, self.shutdown.subscribe())),
            tokio::spawn(self.clone().retry_loop(self.shutdown.subscribe())),
            tokio::spawn(self.clone().heartbeat_loop(self.shutdown.subscribe())),
        ];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(relay = %self.options.name, "relay shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        self.stop().await;
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "relay task failed");
            }
        }
        Ok(())
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let channel = FramedChannel::from_stream(stream, addr.to_string(), self.options.channel.clone());
        let id = channel.id();
        lock(&self.downstream).insert(
            id,
            Downstream {
                channel: channel.clone(),
                worker: None,
            },
        );
        if let Err(e) = channel.start_receiving(self.downstream_handlers()) {
            tracing::warn!(channel = id, error = %e, "failed to start receiving");
            lock(&self.downstream).remove(&id);
            return;
        }
        tracing::info!(channel = id, peer = %addr, "downstream accepted");

        let node = self.clone();
        tokio::spawn(async move {
            channel.closed().await;
            node.teardown(id, "disconnected").await;
        });
    }

    fn downstream_handlers(self: &Arc<Self>) -> HandlerTable {
        let mut table = HandlerTable::new();

        let node = self.clone();
        table.register(MessageKind::Register, move |ch, env| {
            let req: RegisterRequest = env.payload_as()?;
            if let Some(d) = lock(&node.downstream).get_mut(&ch.id()) {
                d.worker = Some(req.name.clone());
            }
            tracing::info!(channel = ch.id(), worker = %req.name, "worker registered");
            node.notify_upstream(
                MessageKind::WorkerJoined,
                &WorkerPresence {
                    worker: req.name,
                    relay: node.options.name.clone(),
                },
            );
            let ack = RegisterAck {
                node: node.options.name.clone(),
            };
            Ok(Some(Reply::json(MessageKind::RegisterAck, &ack)?))
        });

        // Presence notices from a child relay expect no reply; pass them on
        // without a pending entry.
        for kind in [MessageKind::WorkerJoined, MessageKind::WorkerLeft] {
            let node = self.clone();
            table.register(kind, move |ch, env| {
                let presence: WorkerPresence = env.payload_as()?;
                tracing::debug!(
                    channel = ch.id(),
                    kind = %env.kind,
                    worker = %presence.worker,
                    relay = %presence.relay,
                    "presence passed upstream"
                );
                node.notify_upstream(env.kind.clone(), &presence);
                Ok(None)
            });
        }

        let relay_tx = self.relay_tx.clone();
        table.register_default(move |ch, env| {
            relay_tx
                .send(Relayed {
                    envelope: env.clone(),
                    origin: ch.id(),
                })
                .map_err(|_| HandlerError::new("relay is shutting down"))?;
            Ok(None)
        });

        table
    }

    async fn forward_loop(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<Relayed>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                next = queue.recv() => match next {
                    Some(relayed) => self.forward(relayed).await,
                    None => break,
                },
            }
        }
    }

    async fn forward(&self, relayed: Relayed) {
        let Relayed { mut envelope, origin } = relayed;
        if !lock(&self.downstream).contains_key(&origin) {
            tracing::debug!(channel = origin, "origin gone, request dropped");
            return;
        }

        envelope.relay_path.push(self.options.name.clone());
        let frame = match wire::encode_envelope(&envelope, self.options.channel.max_frame) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(channel = origin, error = %e, "request not forwardable");
                self.fail_downstream(origin, &envelope, e.to_string(), 0);
                return;
            }
        };

        let id = envelope.message_id.clone();
        let kind = envelope.kind.clone();
        lock(&self.pending).insert(PendingRelayEntry::new(
            origin,
            envelope,
            frame.clone(),
            Instant::now(),
        ));

        match self.upstream() {
            Some(upstream) => match upstream.send_frame(frame).await {
                Ok(()) => tracing::debug!(channel = origin, message_id = %id, kind = %kind, "forwarded upstream"),
                Err(e) => tracing::warn!(message_id = %id, error = %e, "upstream send failed, left for retry"),
            },
            None => tracing::debug!(message_id = %id, "upstream down, left for retry"),
        }
    }

    async fn outbound_loop(
        self: Arc<Self>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => break,
                next = outbound.recv() => next,
            };
            match next {
                Some(Outbound::Deliver { downstream, envelope }) => {
                    let channel = lock(&self.downstream).get(&downstream).map(|d| d.channel.clone());
                    let Some(channel) = channel else {
                        tracing::debug!(channel = downstream, kind = %envelope.kind, "downstream gone, dropped");
                        continue;
                    };
                    if let Err(e) = channel.send_envelope(&envelope).await {
                        tracing::warn!(channel = downstream, error = %e, "downstream send failed");
                        self.teardown(downstream, "send failed").await;
                    }
                }
                Some(Outbound::Stop) => {
                    let _ = self.shutdown.send(());
                }
                None => break,
            }
        }
    }

    /// Queue a `relay_failure` for `downstream`, correlated to `request`.
    pub(super) fn fail_downstream(
        &self,
        downstream: ChannelId,
        request: &Envelope,
        reason: String,
        attempts: u32,
    ) {
        let payload = serde_json::to_value(spindle_core::work::RelayFailure { reason, attempts })
            .unwrap_or_default();
        let envelope = Envelope::reply_to(request, MessageKind::RelayFailure, payload);
        let _ = self.outbound_tx.send(Outbound::Deliver { downstream, envelope });
    }

    /// Fire-and-forget notice to the upstream tier, if connected.
    pub(super) fn notify_upstream<T: Serialize>(&self, kind: MessageKind, payload: &T) {
        let Some(upstream) = self.upstream() else {
            return;
        };
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "notice not encodable");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = upstream.send(kind.clone(), payload, None).await {
                tracing::debug!(kind = %kind, error = %e, "upstream notice failed");
            }
        });
    }

    /// Census answered locally to `report_status`.
    pub fn census(&self) -> StatusReport {
        let mut workers: Vec<String> = lock(&self.downstream)
            .values()
            .map(|d| d.worker.clone().unwrap_or_else(|| d.channel.label().to_string()))
            .collect();
        workers.sort();
        StatusReport {
            node: self.options.name.clone(),
            workers,
            queue: None,
            relays: Vec::new(),
        }
    }

    async fn stop(&self) {
        let channels: Vec<FramedChannel> = lock(&self.downstream)
            .drain()
            .map(|(_, d)| d.channel)
            .collect();
        lock(&self.pending).clear();
        for channel in channels {
            channel.close().await;
        }
        let upstream = lock(&self.upstream).take();
        if let Some(upstream) = upstream {
            upstream.close().await;
        }
        self.upstream_state.send_replace(ChannelState::Closed);
    }
}
