//! Periodic relay maintenance: request retries, heartbeats, teardown.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use spindle_core::work::WorkerPresence;
use spindle_core::MessageKind;

use super::node::RelayNode;
use crate::channel::{ChannelId, FramedChannel};
use crate::lock;

impl RelayNode {
    pub(super) async fn retry_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.options.retry_sweep);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => self.retry_sweep().await,
            }
        }
    }

    pub(super) async fn heartbeat_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.options.heartbeat);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => self.heartbeat_sweep().await,
            }
        }
    }

    /// Resend overdue requests upstream; fail the ones out of retries.
    pub async fn retry_sweep(&self) {
        let outcome = lock(&self.pending).sweep(
            Instant::now(),
            self.options.response_timeout,
            self.options.max_retries,
        );

        if !outcome.resend.is_empty() {
            match self.upstream() {
                Some(upstream) => {
                    for (id, frame) in outcome.resend {
                        if let Err(e) = upstream.send_frame(frame).await {
                            tracing::debug!(message_id = %id, error = %e, "retry send failed");
                            break;
                        }
                        tracing::debug!(message_id = %id, "request retried");
                    }
                }
                None => tracing::debug!(
                    overdue = outcome.resend.len(),
                    "upstream down, retries counted"
                ),
            }
        }

        for entry in outcome.expired {
            tracing::warn!(
                channel = entry.downstream,
                message_id = %entry.envelope.message_id,
                attempts = entry.attempts(),
                "retry budget exhausted"
            );
            self.fail_downstream(
                entry.downstream,
                &entry.envelope,
                "no response from upstream".into(),
                entry.attempts(),
            );
        }
    }

    /// Heartbeat upstream and every downstream. A downstream that cannot
    /// take a heartbeat is torn down.
    pub async fn heartbeat_sweep(&self) {
        if let Some(upstream) = self.upstream() {
            if let Err(e) = upstream.send_heartbeat().await {
                tracing::warn!(error = %e, "upstream heartbeat failed");
            }
        }

        let channels: Vec<(ChannelId, FramedChannel)> = lock(&self.downstream)
            .iter()
            .map(|(id, d)| (*id, d.channel.clone()))
            .collect();
        for (id, channel) in channels {
            if let Err(e) = channel.send_heartbeat().await {
                tracing::warn!(channel = id, error = %e, "downstream heartbeat failed");
                self.teardown(id, "heartbeat failed").await;
            }
        }
    }

    /// Forget a downstream: remove it, drop its pending requests, tell the
    /// tier above, close the socket. Repeat calls are no-ops.
    pub(super) async fn teardown(&self, id: ChannelId, reason: &str) {
        let removed = {
            let mut downstream = lock(&self.downstream);
            let removed = downstream.remove(&id);
            if removed.is_some() {
                let purged = lock(&self.pending).purge_downstream(id);
                if purged > 0 {
                    tracing::debug!(channel = id, purged, "pending requests dropped");
                }
            }
            removed
        };
        let Some(downstream) = removed else {
            return;
        };

        tracing::info!(channel = id, reason, worker = ?downstream.worker, "downstream torn down");
        if let Some(worker) = downstream.worker {
            self.notify_upstream(
                MessageKind::WorkerLeft,
                &WorkerPresence {
                    worker,
                    relay: self.options.name.clone(),
                },
            );
        }
        downstream.channel.close().await;
    }
}
