//! spindle-core: shared types, wire format, and configuration.
//! All other spindle crates depend on this one.

pub mod config;
pub mod envelope;
pub mod wire;
pub mod work;

pub use envelope::{Envelope, MessageId, MessageKind};
pub use wire::{FrameDecoder, WireError};
pub use work::{Assignment, ItemState, ResetTarget, WorkItem};
