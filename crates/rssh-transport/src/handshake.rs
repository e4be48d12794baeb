//! Tunnel establishment on a freshly accepted gate connection

use crate::codec_error;
use crate::framed::MessageFramed;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rssh_gatekeeper::AgentSlot;
use rssh_proto::TunnelMessage;
use rssh_router::TransportError;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Decides whether a connection arriving on a gate is the agent the gate
/// was allocated to
#[async_trait]
pub trait TunnelHandshake: Send + Sync {
    /// Run the server side of the handshake
    ///
    /// On success the connection is ready to carry exchanges for `subdomain`.
    async fn accept(
        &self,
        framed: &mut MessageFramed<TcpStream>,
        slot: &AgentSlot,
        subdomain: &str,
    ) -> Result<(), TransportError>;
}

/// Accepts the connection when its first message names the slot's agent
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentIdHandshake;

#[async_trait]
impl TunnelHandshake for AgentIdHandshake {
    async fn accept(
        &self,
        framed: &mut MessageFramed<TcpStream>,
        slot: &AgentSlot,
        subdomain: &str,
    ) -> Result<(), TransportError> {
        let first = match framed.next().await {
            Some(frame) => frame.map_err(codec_error)?,
            None => return Err(TransportError::Closed),
        };

        match first {
            TunnelMessage::TunnelHello { agent_id } if agent_id == slot.agent_id => {
                framed
                    .send(TunnelMessage::TunnelAccepted {
                        subdomain: subdomain.to_string(),
                    })
                    .await
                    .map_err(codec_error)?;
                debug!("Tunnel handshake for agent {} on {}", agent_id, slot.gate());
                Ok(())
            }
            TunnelMessage::TunnelHello { agent_id } => {
                warn!(
                    "Agent {} tried to claim gate {} allocated to {}",
                    agent_id,
                    slot.gate(),
                    slot.agent_id
                );
                let reason = format!("gate {} is not allocated to {}", slot.gate(), agent_id);
                let _ = framed
                    .send(TunnelMessage::Rejected {
                        reason: reason.clone(),
                    })
                    .await;
                Err(TransportError::Rejected(reason))
            }
            other => Err(TransportError::Protocol(format!(
                "expected TunnelHello, got {:?}",
                other
            ))),
        }
    }
}
