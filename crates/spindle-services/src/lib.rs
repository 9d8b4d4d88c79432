//! spindle-services: channels, the dispatch queue, and the node roles
//! built on them (dispatcher, relay, worker client).

pub mod channel;
pub mod dedup;
pub mod dispatch_queue;
pub mod dispatcher;
pub mod handlers;
pub mod relay;
pub mod transition_log;
pub mod worker;

pub use channel::{ChannelError, ChannelId, ChannelOptions, ChannelState, FramedChannel};
pub use dispatch_queue::{Completion, Dispatch, DispatchError, DispatchQueue};
pub use dispatcher::Dispatcher;
pub use handlers::{HandlerError, HandlerTable, Reply};
pub use relay::{RelayNode, RelayOptions};
pub use worker::{ClientError, WorkerClient};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
