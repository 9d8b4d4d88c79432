//! Worker-side client: connect to a relay (or the dispatcher directly),
//! register, then pull items and report them done.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use spindle_core::work::{
    CompletionAck, CompletionReport, ErrorReply, ItemRequest, RegisterAck, RegisterRequest,
    RelayFailure, ResetAck, ResetRequest, StatusReport,
};
use spindle_core::{Assignment, MessageKind, ResetTarget, WireError};

use crate::channel::{ChannelError, ChannelOptions, FramedChannel};
use crate::handlers::HandlerTable;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("relay gave up after {attempts} attempt(s): {reason}")]
    RelayFailed { reason: String, attempts: u32 },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("expected {expected}, got {got}")]
    Unexpected { expected: MessageKind, got: MessageKind },
}

pub struct WorkerClient {
    name: String,
    node: String,
    channel: FramedChannel,
    timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl WorkerClient {
    /// Connect to `addr` and complete the registration handshake.
    ///
    /// `timeout` bounds each request; through a relay it should exceed the
    /// relay's full retry budget.
    pub async fn connect(
        addr: &str,
        name: impl Into<String>,
        options: ChannelOptions,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let name = name.into();
        let channel = FramedChannel::connect(addr, format!("worker {name}"), options).await?;

        let (shutdown_tx, shutdown) = watch::channel(false);
        let mut table = HandlerTable::new();
        table.register(MessageKind::Shutdown, move |_, _| {
            tracing::info!("shutdown received");
            shutdown_tx.send_replace(true);
            Ok(None)
        });
        channel.start_receiving(table)?;

        let mut client = Self {
            name,
            node: String::new(),
            channel,
            timeout,
            shutdown,
        };
        let ack: RegisterAck = client
            .call(
                MessageKind::Register,
                &RegisterRequest {
                    name: client.name.clone(),
                },
                MessageKind::RegisterAck,
            )
            .await?;
        tracing::info!(worker = %client.name, node = %ack.node, "registered");
        client.node = ack.node;
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the node that acknowledged registration.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn channel(&self) -> &FramedChannel {
        &self.channel
    }

    /// Ask for work. `prior_id` is the last item this worker was given and
    /// did not finish.
    pub async fn next_item(&self, prior_id: Option<u64>) -> Result<Assignment, ClientError> {
        let req = ItemRequest {
            worker: self.name.clone(),
            prior_id,
        };
        self.call(MessageKind::RequestItem, &req, MessageKind::Assignment)
            .await
    }

    pub async fn report_complete(&self, id: u64) -> Result<CompletionAck, ClientError> {
        let report = CompletionReport {
            id,
            worker: self.name.clone(),
        };
        self.call(MessageKind::ReportComplete, &report, MessageKind::CompleteAck)
            .await
    }

    pub async fn force_reset(&self, target: ResetTarget) -> Result<ResetAck, ClientError> {
        self.call(MessageKind::ForceReset, &ResetRequest { target }, MessageKind::ResetAck)
            .await
    }

    pub async fn status(&self) -> Result<StatusReport, ClientError> {
        self.call(MessageKind::ReportStatus, &serde_json::Value::Null, MessageKind::StatusReport)
            .await
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when a `shutdown` broadcast arrives or the channel closes.
    pub async fn wait_for_shutdown(&self) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.wait_for(|requested| *requested) => {}
            _ = self.channel.closed() => {}
        }
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        kind: MessageKind,
        request: &Req,
        expected: MessageKind,
    ) -> Result<Resp, ClientError> {
        let payload = serde_json::to_value(request).map_err(|e| WireError::Encode(e.to_string()))?;
        let response = self.channel.request(kind, payload, self.timeout).await?;
        match response.kind {
            ref got if *got == expected => Ok(response.payload_as()?),
            MessageKind::RelayFailure => {
                let failure: RelayFailure = response.payload_as()?;
                Err(ClientError::RelayFailed {
                    reason: failure.reason,
                    attempts: failure.attempts,
                })
            }
            MessageKind::Error => {
                let error: ErrorReply = response.payload_as()?;
                Err(ClientError::Remote(error.error))
            }
            got => Err(ClientError::Unexpected { expected, got }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch_queue::DispatchQueue;
    use crate::dispatcher::Dispatcher;
    use serde_json::json;
    use spindle_core::work::items_from_json;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    async fn dispatcher(items: serde_json::Value) -> (String, broadcast::Sender<()>) {
        let queue = Arc::new(DispatchQueue::new(items_from_json(items).unwrap()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = broadcast::channel(1);
        let d = Dispatcher::new("root", listener, queue, ChannelOptions::default(), Duration::from_secs(30), rx);
        tokio::spawn(d.run());
        (addr, tx)
    }

    #[tokio::test]
    async fn direct_worker_lifecycle() {
        let (addr, _tx) = dispatcher(json!([{"x": 1}, {"x": 2}])).await;
        let worker = WorkerClient::connect(&addr, "w1", ChannelOptions::default(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(worker.node(), "root");

        let first = worker.next_item(None).await.unwrap();
        let id = first.item().unwrap().id;
        assert_eq!(first.item().unwrap().parameters["x"], json!(1));
        let ack = worker.report_complete(id).await.unwrap();
        assert!(!ack.already_completed);
        assert!(worker.report_complete(id).await.unwrap().already_completed);

        let second = worker.next_item(None).await.unwrap();
        assert_eq!(second.item().unwrap().id, 2);
        let reset = worker.force_reset(ResetTarget::Single(2)).await.unwrap();
        assert_eq!(reset.reset, vec![2]);

        let status = worker.status().await.unwrap();
        assert_eq!(status.workers, vec!["w1".to_string()]);
        worker.close().await;
    }

    #[tokio::test]
    async fn remote_errors_surface_as_client_errors() {
        let (addr, _tx) = dispatcher(json!([{"x": 1}])).await;
        let worker = WorkerClient::connect(&addr, "w1", ChannelOptions::default(), Duration::from_secs(2))
            .await
            .unwrap();
        let err = worker.report_complete(99).await.unwrap_err();
        assert!(matches!(err, ClientError::Remote(ref msg) if msg.contains("unknown item 99")));
        worker.close().await;
    }

    #[tokio::test]
    async fn shutdown_broadcast_reaches_worker() {
        let (addr, tx) = dispatcher(json!([])).await;
        let worker = WorkerClient::connect(&addr, "w1", ChannelOptions::default(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(worker.next_item(None).await.unwrap().is_end_of_work());
        assert!(!worker.shutdown_requested());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), worker.wait_for_shutdown())
            .await
            .unwrap();
        assert!(worker.shutdown_requested());
    }
}
