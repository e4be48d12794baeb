//! Gate allocation for agent tunnels
//!
//! A gate is a public `(host, port)` bind point. The [`GateKeeper`] hands each
//! connecting agent exactly one gate out of the configured hosts and port
//! range, and makes the reservation globally unique through the compare-and-swap
//! primitives of a [`rssh_store::SlotStore`].

pub mod gate;
pub mod keeper;
pub mod retry;

pub use gate::{AgentSlot, Gate, PortRange};
pub use keeper::{GateKeeper, GateKeeperConfig};
pub use retry::{Backoff, RetryPolicy};

use rssh_store::StoreError;
use thiserror::Error;

/// Gatekeeper errors
#[derive(Debug, Error)]
pub enum GateKeeperError {
    #[error("No free port in {low}-{high} on any gate host")]
    PoolExhausted { low: u16, high: u16 },

    #[error("Slot {host}:{port} is no longer owned by agent {agent_id}")]
    SlotNotOwned {
        host: String,
        port: u16,
        agent_id: String,
    },

    #[error("Slot store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid port range '{0}': expected two dash separated integers")]
    InvalidPortRange(String),

    #[error("No gate host configured")]
    NoHosts,
}
