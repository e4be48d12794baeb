//! Agent lifecycle orchestration
//!
//! The [`Executor`] accepts agents on the control port, authenticates them,
//! obtains a gate from the [`rssh_gatekeeper::GateKeeper`], waits for the
//! agent's tunnel on an [`AgentListener`] and publishes it in the
//! [`rssh_router::TunnelRegistry`]. Every lifecycle ends by deregistering the
//! tunnel, releasing the slot and stopping the listener, in that order.

pub mod executor;
pub mod lifecycle;
pub mod listener;

pub use executor::{Executor, ExecutorConfig, ExecutorError};
pub use lifecycle::{AgentState, LifecycleHandle, LifecycleTracker};
pub use listener::{AgentListener, ListenerError, ListenerState};
