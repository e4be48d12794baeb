//! Public HTTP front door routing requests to agent tunnels by host

pub mod server;

pub use server::{Dispatcher, DispatcherConfig, DispatcherError};
