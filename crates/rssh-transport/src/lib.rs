//! Agent tunnel transport over a single TCP connection
//!
//! After the gate connection passes a [`TunnelHandshake`], it is wrapped in a
//! [`FramedTunnel`]: every proxied client connection becomes one exchange,
//! carried as `ExchangeOpen`/`ExchangeData`/`ExchangeEnd` frames of the
//! shared [`rssh_proto::TunnelMessage`] protocol.

pub mod framed;
pub mod handshake;

pub use framed::{FramedTunnel, MessageFramed, DEFAULT_MAX_EXCHANGES};
pub use handshake::{AgentIdHandshake, TunnelHandshake};

use rssh_proto::CodecError;
use rssh_router::TransportError;

pub(crate) fn codec_error(e: CodecError) -> TransportError {
    match e {
        CodecError::IoError(e) => TransportError::Io(e),
        other => TransportError::Protocol(other.to_string()),
    }
}
