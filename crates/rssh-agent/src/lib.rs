//! Reference agent
//!
//! Connects to a broker's control port, takes the gate it is given and serves
//! every exchange arriving over the tunnel from a local TCP service.

pub mod client;

pub use client::{AgentClient, AgentConfig, AgentConnection, AgentError};
