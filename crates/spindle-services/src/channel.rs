//! Framed channel: one TCP stream carrying length-prefixed JSON envelopes.
//!
//! Each channel runs two tasks:
//!
//!   writer   owns the write half and drains the outbox, one frame per
//!            `write_all`, so writes never interleave.
//!   reader   owns the read half, reassembles frames, suppresses duplicate
//!            message ids and routes envelopes through a frozen
//!            [`HandlerTable`]. Frames are handled one at a time, in order.
//!
//! Any transport error (reset, EOF, oversized or malformed frame) moves the
//! channel to `Closed`, which is terminal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use spindle_core::config::ChannelSettings;
use spindle_core::wire::{self, FrameDecoder, WireError};
use spindle_core::work::ErrorReply;
use spindle_core::{Envelope, MessageId, MessageKind};

use crate::dedup::{DedupCache, Seen};
use crate::handlers::{Handler, HandlerError, HandlerResult, HandlerTable};
use crate::lock;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 8 * 1024;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub type ChannelId = u64;

// ── State ─────────────────────────────────────────────────────────────────────

/// Lifecycle of a connection. Transitions only move forward.
///
/// A `FramedChannel` value exists from `Connected` onward; `Idle` and
/// `Connecting` are reported by whatever is dialing (see the relay's
/// upstream link).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Move `state` to `next` if that is a forward step.
pub(crate) fn advance(state: &watch::Sender<ChannelState>, next: ChannelState) -> bool {
    state.send_if_modified(|current| {
        if next > *current {
            *current = next;
            true
        } else {
            false
        }
    })
}

// ── Options & errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub max_frame: usize,
    pub dedup_capacity: usize,
    pub close_timeout: Duration,
    pub outbox_capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from(&ChannelSettings::default())
    }
}

impl From<&ChannelSettings> for ChannelOptions {
    fn from(s: &ChannelSettings) -> Self {
        Self {
            max_frame: s.max_frame_bytes,
            dedup_capacity: s.dedup_capacity,
            close_timeout: Duration::from_millis(s.close_timeout_ms),
            outbox_capacity: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(ChannelId),

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("failed to connect to {addr} after {attempts} attempt(s): {source}")]
    ConnectFailed {
        addr: String,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("receive loop already started on channel {0}")]
    AlreadyReceiving(ChannelId),

    #[error(transparent)]
    Wire(#[from] WireError),
}

// ── Channel ───────────────────────────────────────────────────────────────────

struct Outgoing {
    frame: Bytes,
    done: oneshot::Sender<Result<(), ChannelError>>,
}

struct Inner {
    id: ChannelId,
    label: String,
    peer: Option<SocketAddr>,
    options: ChannelOptions,
    state: watch::Sender<ChannelState>,
    closing: AtomicBool,
    outbox: mpsc::Sender<Outgoing>,
    reader: Mutex<Option<OwnedReadHalf>>,
    awaiting: Mutex<HashMap<MessageId, oneshot::Sender<Envelope>>>,
    dedup: Mutex<DedupCache>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct FramedChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FramedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedChannel")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl FramedChannel {
    /// Dial `addr` once.
    pub async fn connect(
        addr: &str,
        label: impl Into<String>,
        options: ChannelOptions,
    ) -> Result<Self, ChannelError> {
        Self::connect_with_retry(addr, label, options, Some(1), Duration::ZERO).await
    }

    /// Dial `addr`, retrying after `delay`. `max_attempts = None` retries forever.
    pub async fn connect_with_retry(
        addr: &str,
        label: impl Into<String>,
        options: ChannelOptions,
        max_attempts: Option<u32>,
        delay: Duration,
    ) -> Result<Self, ChannelError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    tracing::info!(addr, attempt, "connected");
                    return Ok(Self::from_stream(stream, label, options));
                }
                Err(e) => {
                    if max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(ChannelError::ConnectFailed {
                            addr: addr.to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    tracing::warn!(addr, attempt, error = %e, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Wrap an established stream. Spawns the writer; call
    /// [`start_receiving`](Self::start_receiving) to begin reading.
    pub fn from_stream(stream: TcpStream, label: impl Into<String>, options: ChannelOptions) -> Self {
        tune_stream(&stream);
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(options.outbox_capacity.max(1));
        let (state, _) = watch::channel(ChannelState::Connected);

        let channel = Self {
            inner: Arc::new(Inner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                peer,
                dedup: Mutex::new(DedupCache::new(options.dedup_capacity)),
                options,
                state,
                closing: AtomicBool::new(false),
                outbox: outbox_tx,
                reader: Mutex::new(Some(read_half)),
                awaiting: Mutex::new(HashMap::new()),
                reader_task: Mutex::new(None),
                writer_task: Mutex::new(None),
            }),
        };

        let writer = tokio::spawn(write_loop(channel.clone(), write_half, outbox_rx));
        *lock(&channel.inner.writer_task) = Some(writer);
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Build an envelope and send it. A fresh id is generated unless one is given.
    pub async fn send(
        &self,
        kind: MessageKind,
        payload: Value,
        message_id: Option<MessageId>,
    ) -> Result<MessageId, ChannelError> {
        let envelope = Envelope::with_id(
            message_id.unwrap_or_else(MessageId::generate),
            kind,
            payload,
        );
        self.send_envelope(&envelope).await?;
        Ok(envelope.message_id)
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let frame = wire::encode_envelope(envelope, self.inner.options.max_frame)?;
        self.send_frame(frame).await
    }

    /// Queue an already-encoded frame and wait until it is written.
    pub async fn send_frame(&self, frame: Bytes) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Closed(self.inner.id));
        }
        let (done, written) = oneshot::channel();
        self.inner
            .outbox
            .send(Outgoing { frame, done })
            .await
            .map_err(|_| ChannelError::Closed(self.inner.id))?;
        written.await.map_err(|_| ChannelError::Closed(self.inner.id))?
    }

    pub async fn send_heartbeat(&self) -> Result<(), ChannelError> {
        self.send_envelope(&Envelope::heartbeat()).await
    }

    /// Send a request and wait for the envelope that correlates to it.
    ///
    /// Only works once the receive loop is running.
    pub async fn request(
        &self,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) -> Result<Envelope, ChannelError> {
        let id = MessageId::generate();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.awaiting).insert(id.clone(), tx);

        if let Err(e) = self.send(kind, payload, Some(id.clone())).await {
            lock(&self.inner.awaiting).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ChannelError::Closed(self.inner.id)),
            Err(_) => {
                lock(&self.inner.awaiting).remove(&id);
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    // ── Receiving ─────────────────────────────────────────────────────────────

    /// Start the receive loop. The handler table is frozen from here on.
    pub fn start_receiving(&self, handlers: HandlerTable) -> Result<(), ChannelError> {
        let reader = lock(&self.inner.reader)
            .take()
            .ok_or(ChannelError::AlreadyReceiving(self.inner.id))?;
        let task = tokio::spawn(receive_loop(self.clone(), reader, Arc::new(handlers)));
        *lock(&self.inner.reader_task) = Some(task);
        Ok(())
    }

    async fn handle_incoming(&self, handlers: &HandlerTable, envelope: Envelope) {
        if envelope.is_heartbeat() {
            tracing::trace!(channel = self.inner.id, "heartbeat");
            return;
        }

        if let Some(correlates) = &envelope.correlates_to {
            let waiter = lock(&self.inner.awaiting).remove(correlates);
            if let Some(waiter) = waiter {
                let _ = waiter.send(envelope);
                return;
            }
        }

        let seen = lock(&self.inner.dedup).observe(&envelope.message_id);
        match seen {
            Seen::New => {}
            Seen::Answered(frame) => {
                tracing::debug!(
                    channel = self.inner.id,
                    message_id = %envelope.message_id,
                    "duplicate, resending cached response"
                );
                if let Err(e) = self.send_frame(frame).await {
                    tracing::debug!(channel = self.inner.id, error = %e, "cached resend failed");
                }
                return;
            }
            Seen::Unanswered => {
                tracing::debug!(
                    channel = self.inner.id,
                    message_id = %envelope.message_id,
                    "duplicate dropped"
                );
                return;
            }
        }

        let Some(handler) = handlers.resolve(&envelope.kind) else {
            tracing::warn!(
                channel = self.inner.id,
                kind = %envelope.kind,
                "no handler, message dropped"
            );
            return;
        };

        let response = match invoke(handler, self, &envelope) {
            Ok(Some(reply)) => Envelope::reply_to(&envelope, reply.kind, reply.payload),
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    channel = self.inner.id,
                    kind = %envelope.kind,
                    error = %e,
                    "handler failed"
                );
                let payload = serde_json::to_value(ErrorReply::handler_failure(e.0))
                    .unwrap_or(Value::Null);
                Envelope::reply_to(&envelope, MessageKind::Error, payload)
            }
        };

        let frame = match wire::encode_envelope(&response, self.inner.options.max_frame) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(channel = self.inner.id, error = %e, "response not encodable");
                return;
            }
        };
        lock(&self.inner.dedup).record_response(&envelope.message_id, frame.clone());
        if let Err(e) = self.send_frame(frame).await {
            tracing::debug!(channel = self.inner.id, error = %e, "response send failed");
        }
    }

    // ── Closing ───────────────────────────────────────────────────────────────

    /// Close the channel and wait (bounded) for both tasks to stop.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mark_closed("closed locally");

        let handles = [
            lock(&self.inner.reader_task).take(),
            lock(&self.inner.writer_task).take(),
        ];
        for handle in handles.into_iter().flatten() {
            if tokio::time::timeout(self.inner.options.close_timeout, handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    channel = self.inner.id,
                    timeout = ?self.inner.options.close_timeout,
                    "channel task did not stop in time"
                );
            }
        }
    }

    /// Resolves once the channel reaches `Closed`.
    pub async fn closed(&self) {
        wait_closed(self.inner.state.subscribe()).await;
    }

    fn mark_closed(&self, reason: &str) {
        if advance(&self.inner.state, ChannelState::Closed) {
            tracing::info!(
                channel = self.inner.id,
                label = %self.inner.label,
                reason,
                "channel closed"
            );
            lock(&self.inner.awaiting).clear();
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Owns its receiver so the borrowed state never lives across another await.
async fn wait_closed(mut state: watch::Receiver<ChannelState>) {
    let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
}

async fn write_loop(
    channel: FramedChannel,
    mut half: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Outgoing>,
) {
    let closed = wait_closed(channel.inner.state.subscribe());
    tokio::pin!(closed);
    loop {
        tokio::select! {
            biased;
            _ = &mut closed => break,
            next = outbox.recv() => {
                let Some(out) = next else { break };
                match half.write_all(&out.frame).await {
                    Ok(()) => {
                        let _ = out.done.send(Ok(()));
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        let _ = out.done.send(Err(ChannelError::Disconnected(reason.clone())));
                        channel.mark_closed(&reason);
                        break;
                    }
                }
            }
        }
    }
    let stream: &TcpStream = half.as_ref();
    if let Err(e) = SockRef::from(stream).shutdown(std::net::Shutdown::Both) {
        tracing::trace!(channel = channel.inner.id, error = %e, "socket shutdown");
    }
}

async fn receive_loop(channel: FramedChannel, mut reader: OwnedReadHalf, handlers: Arc<HandlerTable>) {
    let closed = wait_closed(channel.inner.state.subscribe());
    tokio::pin!(closed);
    let mut decoder = FrameDecoder::new(channel.inner.options.max_frame);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let reason = 'outer: loop {
        loop {
            match decoder.decode_envelope(&mut buf) {
                Ok(Some(envelope)) => channel.handle_incoming(&handlers, envelope).await,
                Ok(None) => break,
                Err(e) => break 'outer e.to_string(),
            }
        }

        buf.reserve(READ_CHUNK);
        tokio::select! {
            _ = &mut closed => break 'outer "closed locally".to_string(),
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) if buf.is_empty() => break 'outer "remote closed".to_string(),
                Ok(0) => break 'outer WireError::Truncated(buf.len()).to_string(),
                Ok(_) => {}
                Err(e) => break 'outer e.to_string(),
            },
        }
    };

    channel.mark_closed(&reason);
}

/// Run a handler, turning a panic into a [`HandlerError`].
fn invoke(handler: &Handler, channel: &FramedChannel, envelope: &Envelope) -> HandlerResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(channel, envelope))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".into());
            Err(HandlerError::new(format!("handler panicked: {msg}")))
        }
    }
}

fn tune_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "failed to enable tcp keepalive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Reply;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    fn spawnable<A, B, C, F>(_: fn(A, B, C) -> F)
    where
        F: std::future::Future + Send + 'static,
    {
    }

    #[test]
    fn channel_tasks_are_send() {
        spawnable(write_loop);
        spawnable(receive_loop);
    }

    fn counting_echo(count: Arc<AtomicUsize>) -> HandlerTable {
        let mut table = HandlerTable::new();
        table.register(MessageKind::RequestItem, move |_, env| {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(Reply::new(
                MessageKind::Assignment,
                json!({"echo": env.payload, "call": n}),
            )))
        });
        table
    }

    #[tokio::test]
    async fn duplicate_id_gets_identical_bytes_and_one_handler_call() {
        let (mut client, server) = pair().await;
        let count = Arc::new(AtomicUsize::new(0));
        let channel = FramedChannel::from_stream(server, "test", ChannelOptions::default());
        channel.start_receiving(counting_echo(count.clone())).unwrap();

        let request = Envelope::with_id("dup-1".into(), MessageKind::RequestItem, json!({"w": 1}));
        let frame = wire::encode_envelope(&request, wire::DEFAULT_MAX_FRAME).unwrap();
        client.write_all(&frame).await.unwrap();
        let first = read_frame(&mut client).await;
        client.write_all(&frame).await.unwrap();
        let second = read_frame(&mut client).await;

        assert_eq!(first, second);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let response: Envelope = serde_json::from_slice(&first).unwrap();
        assert_eq!(response.correlates_to, Some(MessageId::from("dup-1")));
        assert_eq!(response.kind, MessageKind::Assignment);
        channel.close().await;
    }

    #[tokio::test]
    async fn one_byte_writes_are_reassembled() {
        let (mut client, server) = pair().await;
        let count = Arc::new(AtomicUsize::new(0));
        let channel = FramedChannel::from_stream(server, "test", ChannelOptions::default());
        channel.start_receiving(counting_echo(count.clone())).unwrap();

        let request = Envelope::new(MessageKind::RequestItem, json!({"slow": true}));
        let frame = wire::encode_envelope(&request, wire::DEFAULT_MAX_FRAME).unwrap();
        for byte in frame.iter() {
            client.write_all(&[*byte]).await.unwrap();
            client.flush().await.unwrap();
            tokio::task::yield_now().await;
        }

        let response: Envelope = serde_json::from_slice(&read_frame(&mut client).await).unwrap();
        assert_eq!(response.correlates_to, Some(request.message_id));
        assert_eq!(response.payload["echo"], json!({"slow": true}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        channel.close().await;
    }

    #[tokio::test]
    async fn handler_panic_becomes_error_reply_and_loop_survives() {
        let (client, server) = pair().await;
        let mut table = HandlerTable::new();
        table.register(MessageKind::ForceReset, |_, _| panic!("boom"));
        table.register(MessageKind::RequestItem, |_, _| {
            Ok(Some(Reply::new(MessageKind::Assignment, json!({"ok": true}))))
        });
        let server = FramedChannel::from_stream(server, "server", ChannelOptions::default());
        server.start_receiving(table).unwrap();

        let client = FramedChannel::from_stream(client, "client", ChannelOptions::default());
        client.start_receiving(HandlerTable::new()).unwrap();

        let timeout = Duration::from_secs(2);
        let failed = client.request(MessageKind::ForceReset, json!({}), timeout).await.unwrap();
        assert_eq!(failed.kind, MessageKind::Error);
        assert_eq!(failed.payload["status"], json!("handler_exception"));
        assert!(failed.payload["error"].as_str().unwrap().contains("boom"));

        let ok = client.request(MessageKind::RequestItem, json!({}), timeout).await.unwrap();
        assert_eq!(ok.payload["ok"], json!(true));
        assert!(server.is_connected());

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn heartbeats_never_reach_handlers() {
        let (client, server) = pair().await;
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut table = HandlerTable::new();
        table.register_default(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });
        let server = FramedChannel::from_stream(server, "server", ChannelOptions::default());
        server.start_receiving(table).unwrap();
        let client = FramedChannel::from_stream(client, "client", ChannelOptions::default());

        client.send_heartbeat().await.unwrap();
        client.send(MessageKind::WorkerLeft, json!({}), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn malformed_json_closes_the_channel() {
        let (mut client, server) = pair().await;
        let channel = FramedChannel::from_stream(server, "test", ChannelOptions::default());
        channel.start_receiving(HandlerTable::new()).unwrap();

        client
            .write_all(&wire::encode_frame(b"{oops", wire::DEFAULT_MAX_FRAME).unwrap())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), channel.closed())
            .await
            .expect("channel should close");
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn remote_disconnect_is_detected_and_sends_fail() {
        let (client, server) = pair().await;
        let channel = FramedChannel::from_stream(server, "test", ChannelOptions::default());
        channel.start_receiving(HandlerTable::new()).unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(2), channel.closed())
            .await
            .expect("channel should close");
        assert!(matches!(
            channel.send(MessageKind::Heartbeat, Value::Null, None).await,
            Err(ChannelError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let (_client, server) = pair().await;
        let channel = FramedChannel::from_stream(server, "test", ChannelOptions::default());
        channel.start_receiving(HandlerTable::new()).unwrap();
        channel.close().await;
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!advance(&channel.inner.state, ChannelState::Connected));
        assert!(matches!(
            channel.start_receiving(HandlerTable::new()),
            Err(ChannelError::AlreadyReceiving(_))
        ));
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        let (client, _server) = pair().await;
        let channel = FramedChannel::from_stream(client, "test", ChannelOptions::default());
        channel.start_receiving(HandlerTable::new()).unwrap();
        let result = channel
            .request(MessageKind::RequestItem, json!({}), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ChannelError::Timeout(_))));
        channel.close().await;
    }

    #[tokio::test]
    async fn connect_with_retry_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = FramedChannel::connect_with_retry(
            &addr,
            "test",
            ChannelOptions::default(),
            Some(2),
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ChannelError::ConnectFailed { attempts: 2, .. })));
    }
}
