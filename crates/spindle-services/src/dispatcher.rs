//! Dispatcher tier: the root of the tree that owns the queue.
//!
//! Accepts relay and worker connections, answers dispatch requests from
//! the shared [`DispatchQueue`], keeps a census of who is connected, and
//! heartbeats every channel. On shutdown every connection receives a
//! `shutdown` envelope before it is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use spindle_core::work::{
    CompletionAck, CompletionReport, ItemRequest, RegisterAck, RegisterRequest, RelayCensus,
    ResetAck, ResetRequest, StatusReport, WorkerPresence,
};
use spindle_core::{Assignment, MessageKind};

use crate::channel::{ChannelId, ChannelOptions, FramedChannel};
use crate::dispatch_queue::{Completion, DispatchQueue};
use crate::handlers::{HandlerError, HandlerTable, Reply};

/// Who is behind each accepted connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CensusEntry {
    /// Set once a relay announces a worker through this connection.
    pub relay: Option<String>,
    pub workers: Vec<String>,
}

pub type Census = Arc<DashMap<ChannelId, CensusEntry>>;

pub fn new_census() -> Census {
    Arc::new(DashMap::new())
}

pub type ConnectionTable = Arc<DashMap<ChannelId, FramedChannel>>;

pub struct Dispatcher {
    name: String,
    listener: TcpListener,
    queue: Arc<DispatchQueue>,
    census: Census,
    connections: ConnectionTable,
    options: ChannelOptions,
    heartbeat: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Dispatcher {
    pub fn new(
        name: impl Into<String>,
        listener: TcpListener,
        queue: Arc<DispatchQueue>,
        options: ChannelOptions,
        heartbeat: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            listener,
            queue,
            census: new_census(),
            connections: Arc::new(DashMap::new()),
            options,
            heartbeat,
            shutdown,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn census(&self) -> Census {
        self.census.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(node = %self.name, addr = ?self.listener.local_addr().ok(), "dispatcher listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("dispatcher shutting down");
                    broadcast_shutdown(&self.connections).await;
                    return Ok(());
                }

                _ = heartbeat.tick() => {
                    tokio::spawn(heartbeat_all(self.connections.clone(), self.census.clone()));
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        let channel = FramedChannel::from_stream(stream, addr.to_string(), self.options.clone());
        let id = channel.id();
        self.connections.insert(id, channel.clone());
        if let Err(e) = channel.start_receiving(self.handler_table()) {
            tracing::warn!(channel = id, error = %e, "failed to start receiving");
            self.connections.remove(&id);
            return;
        }
        tracing::info!(channel = id, peer = %addr, "connection accepted");

        let connections = self.connections.clone();
        let census = self.census.clone();
        tokio::spawn(async move {
            channel.closed().await;
            connections.remove(&id);
            if let Some((_, entry)) = census.remove(&id) {
                tracing::info!(channel = id, relay = ?entry.relay, workers = entry.workers.len(), "connection gone");
            }
        });
    }

    fn handler_table(&self) -> HandlerTable {
        dispatcher_handlers(&self.name, self.queue.clone(), self.census.clone())
    }
}

/// Handlers for a channel accepted by the dispatcher.
pub fn dispatcher_handlers(name: &str, queue: Arc<DispatchQueue>, census: Census) -> HandlerTable {
    let mut table = HandlerTable::new();

    let q = queue.clone();
    table.register(MessageKind::RequestItem, move |_, env| {
        let req: ItemRequest = env.payload_as()?;
        let assignment: Assignment = q.request_item(req.prior_id, &req.worker).into();
        Ok(Some(Reply::json(MessageKind::Assignment, &assignment)?))
    });

    let q = queue.clone();
    table.register(MessageKind::ReportComplete, move |_, env| {
        let report: CompletionReport = env.payload_as()?;
        let outcome = q.report_complete(report.id, &report.worker)?;
        let ack = CompletionAck {
            id: report.id,
            already_completed: outcome == Completion::AlreadyCompleted,
        };
        Ok(Some(Reply::json(MessageKind::CompleteAck, &ack)?))
    });

    let q = queue.clone();
    table.register(MessageKind::ForceReset, move |_, env| {
        let req: ResetRequest = env.payload_as()?;
        let reset = q.force_reset(req.target)?;
        Ok(Some(Reply::json(MessageKind::ResetAck, &ResetAck { reset })?))
    });

    let node = name.to_string();
    let c = census.clone();
    table.register(MessageKind::Register, move |ch, env| {
        let req: RegisterRequest = env.payload_as()?;
        tracing::info!(channel = ch.id(), worker = %req.name, "worker registered");
        let mut entry = c.entry(ch.id()).or_default();
        if !entry.workers.contains(&req.name) {
            entry.workers.push(req.name);
        }
        Ok(Some(Reply::json(MessageKind::RegisterAck, &RegisterAck { node: node.clone() })?))
    });

    let c = census.clone();
    table.register(MessageKind::WorkerJoined, move |ch, env| {
        let presence: WorkerPresence = env.payload_as()?;
        tracing::info!(relay = %presence.relay, worker = %presence.worker, "worker joined");
        let mut entry = c.entry(ch.id()).or_default();
        entry.relay = Some(presence.relay);
        if !entry.workers.contains(&presence.worker) {
            entry.workers.push(presence.worker);
        }
        Ok(None)
    });

    let c = census.clone();
    table.register(MessageKind::WorkerLeft, move |ch, env| {
        let presence: WorkerPresence = env.payload_as()?;
        tracing::info!(relay = %presence.relay, worker = %presence.worker, "worker left");
        if let Some(mut entry) = c.get_mut(&ch.id()) {
            entry.workers.retain(|w| w != &presence.worker);
        }
        Ok(None)
    });

    let node = name.to_string();
    let q = queue;
    let c = census;
    table.register(MessageKind::ReportStatus, move |_, _| {
        let mut report = census_report(&node, &c);
        report.queue = Some(q.summary());
        Ok(Some(Reply::json(MessageKind::StatusReport, &report)?))
    });

    table.register_default(|_, env| {
        Err(HandlerError::new(format!("unsupported message type {}", env.kind)))
    });

    table
}

/// Group the census into direct workers and per-relay worker lists.
pub fn census_report(node: &str, census: &Census) -> StatusReport {
    let mut workers = Vec::new();
    let mut relays: Vec<RelayCensus> = Vec::new();
    for entry in census.iter() {
        match &entry.relay {
            None => workers.extend(entry.workers.iter().cloned()),
            Some(relay) => match relays.iter_mut().find(|r| &r.relay == relay) {
                Some(existing) => existing.workers.extend(entry.workers.iter().cloned()),
                None => relays.push(RelayCensus {
                    relay: relay.clone(),
                    workers: entry.workers.clone(),
                }),
            },
        }
    }
    workers.sort();
    relays.sort_by(|a, b| a.relay.cmp(&b.relay));
    StatusReport {
        node: node.to_string(),
        workers,
        queue: None,
        relays,
    }
}

async fn heartbeat_all(connections: ConnectionTable, census: Census) {
    let channels: Vec<FramedChannel> = connections.iter().map(|e| e.value().clone()).collect();
    for channel in channels {
        if let Err(e) = channel.send_heartbeat().await {
            tracing::warn!(channel = channel.id(), error = %e, "heartbeat failed, dropping connection");
            connections.remove(&channel.id());
            census.remove(&channel.id());
            channel.close().await;
        }
    }
}

/// Send `shutdown` to every connection, then close them all.
pub async fn broadcast_shutdown(connections: &ConnectionTable) {
    let channels: Vec<FramedChannel> = connections.iter().map(|e| e.value().clone()).collect();
    tracing::info!(connections = channels.len(), "broadcasting shutdown");
    for channel in &channels {
        if let Err(e) = channel.send(MessageKind::Shutdown, Value::Null, None).await {
            tracing::debug!(channel = channel.id(), error = %e, "shutdown not delivered");
        }
    }
    for channel in channels {
        channel.close().await;
    }
    connections.clear();
}
