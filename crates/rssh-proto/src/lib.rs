//! Wire protocol shared by the rssh server and its agents
//!
//! A single message enum travels over two kinds of connections:
//! - the control connection, where an agent authenticates and is handed a gate
//! - the tunnel connection on that gate, which carries proxied HTTP exchanges

pub mod codec;
pub mod messages;

pub use codec::{CodecError, TunnelCodec};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
