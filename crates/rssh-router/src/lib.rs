//! Subdomain routing for agent tunnels
//!
//! Holds the in-process subdomain -> tunnel table consulted on every inbound
//! HTTP request, the [`Tunnel`] handle the table stores, and the host-header
//! helpers that turn a `Host:` value into a routing key.

pub mod host;
pub mod registry;
pub mod tunnel;

pub use host::{is_valid_domain, is_valid_label, route_host, tunnel_host, HostError};
pub use registry::{RegistryError, TunnelRegistry};
pub use tunnel::{Exchange, ExchangeStream, TransportError, Tunnel, TunnelTransport};
