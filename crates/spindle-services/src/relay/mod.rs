//! Relay tier. See [`node`] for the task layout.

pub mod node;
pub mod pending;
mod sweep;
mod upstream;

pub use node::{RelayNode, RelayOptions};
pub use pending::{PendingRelayEntry, PendingTable, SweepOutcome};
