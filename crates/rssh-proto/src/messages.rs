//! Protocol message types

use serde::{Deserialize, Serialize};

/// Identifier of one proxied exchange on a tunnel
pub type ExchangeId = u32;

/// Main protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TunnelMessage {
    // Liveness, valid on both connection kinds
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },

    // Control connection
    Hello {
        agent_id: String,
        token: String,
        /// Requested alias label; the agent ID is used when absent
        subdomain: Option<String>,
    },
    SlotAssigned {
        host: String,
        port: u16,
        subdomain: String,
        public_url: String,
    },
    Rejected {
        reason: String,
    },
    Disconnect {
        reason: String,
    },

    // Tunnel connection handshake
    TunnelHello {
        agent_id: String,
    },
    TunnelAccepted {
        subdomain: String,
    },

    // Exchanges carried by an established tunnel
    ExchangeOpen {
        exchange_id: ExchangeId,
    },
    ExchangeData {
        exchange_id: ExchangeId,
        data: Vec<u8>,
    },
    /// Sender finished writing (half-close)
    ExchangeEnd {
        exchange_id: ExchangeId,
    },
    /// Sender hit an error; the exchange is dead in both directions
    ExchangeAbort {
        exchange_id: ExchangeId,
    },
}

impl TunnelMessage {
    /// Exchange this message belongs to, if any
    pub fn exchange_id(&self) -> Option<ExchangeId> {
        match self {
            TunnelMessage::ExchangeOpen { exchange_id }
            | TunnelMessage::ExchangeData { exchange_id, .. }
            | TunnelMessage::ExchangeEnd { exchange_id }
            | TunnelMessage::ExchangeAbort { exchange_id } => Some(*exchange_id),
            _ => None,
        }
    }
}
