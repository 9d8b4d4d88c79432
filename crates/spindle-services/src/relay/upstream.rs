//! The relay's single upstream link: dialing, reconnecting, and routing
//! whatever the tier above sends back.

use std::sync::Arc;

use tokio::sync::broadcast;

use spindle_core::work::WorkerPresence;
use spindle_core::{Envelope, MessageKind};

use super::node::{Outbound, RelayNode};
use crate::channel::{ChannelState, FramedChannel};
use crate::handlers::{HandlerResult, HandlerTable, Reply};
use crate::lock;

impl RelayNode {
    /// Keep one upstream channel open until shutdown. Pending entries are
    /// left alone across reconnects; the retry sweep resends them.
    pub(super) async fn upstream_supervisor(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let addr = self.options.upstream_addr.clone();
        let mut failures = 0u32;

        loop {
            self.set_upstream_state(ChannelState::Connecting);
            let dialed = tokio::select! {
                _ = shutdown.recv() => break,
                dialed = FramedChannel::connect(&addr, format!("upstream {addr}"), self.options.channel.clone()) => dialed,
            };

            match dialed {
                Ok(channel) => {
                    failures = 0;
                    if let Err(e) = channel.start_receiving(self.upstream_handlers()) {
                        tracing::warn!(error = %e, "failed to start upstream receive loop");
                        channel.close().await;
                        continue;
                    }
                    *lock(&self.upstream) = Some(channel.clone());
                    self.set_upstream_state(ChannelState::Connected);
                    tracing::info!(relay = %self.options.name, upstream = %addr, "upstream connected");
                    self.announce_workers(&channel).await;

                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = channel.closed() => {}
                    }
                    lock(&self.upstream).take();
                    tracing::warn!(
                        upstream = %addr,
                        pending = self.pending_count(),
                        "upstream lost, reconnecting"
                    );
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 || failures % 10 == 0 {
                        tracing::warn!(upstream = %addr, failures, error = %e, "upstream unreachable");
                    }
                }
            }

            self.set_upstream_state(ChannelState::Idle);
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
            }
        }
    }

    /// Link state changes freely between reconnects but never leaves `Closed`.
    fn set_upstream_state(&self, next: ChannelState) {
        self.upstream_state.send_if_modified(|current| {
            if *current == ChannelState::Closed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Re-announce registered workers after (re)connecting.
    async fn announce_workers(&self, upstream: &FramedChannel) {
        let workers: Vec<String> = lock(&self.downstream)
            .values()
            .filter_map(|d| d.worker.clone())
            .collect();
        for worker in workers {
            let presence = WorkerPresence {
                worker,
                relay: self.options.name.clone(),
            };
            let payload = serde_json::to_value(&presence).unwrap_or_default();
            if let Err(e) = upstream.send(MessageKind::WorkerJoined, payload, None).await {
                tracing::debug!(error = %e, "worker announcement failed");
                return;
            }
        }
    }

    fn upstream_handlers(self: &Arc<Self>) -> HandlerTable {
        let mut table = HandlerTable::new();
        let node = self.clone();
        table.register_default(move |_, env| node.on_upstream(env));
        table
    }

    /// Route one envelope from the tier above.
    ///
    /// Correlated envelopes answer a pending request and go back to the
    /// downstream that sent it, correlated to the original id. Anything
    /// else is a command: `report_status` is answered here, `shutdown` is
    /// fanned out and then stops the relay, the rest is fanned out.
    fn on_upstream(&self, env: &Envelope) -> HandlerResult {
        if let Some(correlates) = &env.correlates_to {
            let entry = lock(&self.pending).take(correlates);
            match entry {
                Some(entry) => {
                    let response = Envelope::reply_to(&entry.envelope, env.kind.clone(), env.payload.clone());
                    tracing::debug!(
                        channel = entry.downstream,
                        message_id = %correlates,
                        kind = %env.kind,
                        attempts = entry.attempts(),
                        "response routed downstream"
                    );
                    let _ = self.outbound_tx.send(Outbound::Deliver {
                        downstream: entry.downstream,
                        envelope: response,
                    });
                }
                None => tracing::debug!(message_id = %correlates, "no pending entry, response dropped"),
            }
            return Ok(None);
        }

        match env.kind {
            MessageKind::ReportStatus => Ok(Some(Reply::json(MessageKind::StatusReport, &self.census())?)),
            MessageKind::Shutdown => {
                tracing::info!(relay = %self.options.name, "shutdown from upstream");
                self.fan_out(env);
                let _ = self.outbound_tx.send(Outbound::Stop);
                Ok(None)
            }
            _ => {
                self.fan_out(env);
                Ok(None)
            }
        }
    }

    fn fan_out(&self, env: &Envelope) {
        let targets: Vec<_> = lock(&self.downstream).keys().copied().collect();
        tracing::debug!(kind = %env.kind, downstream = targets.len(), "fanning out");
        for downstream in targets {
            let _ = self.outbound_tx.send(Outbound::Deliver {
                downstream,
                envelope: env.clone(),
            });
        }
    }
}
