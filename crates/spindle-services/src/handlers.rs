//! Routes incoming envelopes to handlers by message kind.
//!
//! A table is built up front and handed to
//! [`FramedChannel::start_receiving`], which freezes it for the lifetime of
//! the receive loop.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use spindle_core::{Envelope, MessageKind};

use crate::channel::FramedChannel;

/// Payload a handler wants sent back, correlated to the request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub kind: MessageKind,
    pub payload: Value,
}

impl Reply {
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn json<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Self, HandlerError> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }
}

/// Failure inside a handler. Sent to the peer as an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<spindle_core::WireError> for HandlerError {
    fn from(e: spindle_core::WireError) -> Self {
        Self(e.to_string())
    }
}

impl From<crate::dispatch_queue::DispatchError> for HandlerError {
    fn from(e: crate::dispatch_queue::DispatchError) -> Self {
        Self(e.to_string())
    }
}

pub type HandlerResult = Result<Option<Reply>, HandlerError>;

/// Handlers run on the channel's receive task and must not block.
pub type Handler = Arc<dyn Fn(&FramedChannel, &Envelope) -> HandlerResult + Send + Sync>;

/// Maps message kinds to handlers. At most one handler per kind.
#[derive(Clone, Default)]
pub struct HandlerTable {
    by_kind: HashMap<MessageKind, Handler>,
    fallback: Option<Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `kind`, replacing any earlier one.
    pub fn register<F>(&mut self, kind: MessageKind, handler: F) -> &mut Self
    where
        F: Fn(&FramedChannel, &Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        if self.by_kind.insert(kind.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(kind = %kind, "replaced handler");
        }
        self
    }

    /// Handler for kinds with no specific registration.
    pub fn register_default<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&FramedChannel, &Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn resolve(&self, kind: &MessageKind) -> Option<&Handler> {
        self.by_kind.get(kind).or(self.fallback.as_ref())
    }

    pub fn handles(&self, kind: &MessageKind) -> bool {
        self.resolve(kind).is_some()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .field("has_default", &self.fallback.is_some())
            .finish()
    }
}
