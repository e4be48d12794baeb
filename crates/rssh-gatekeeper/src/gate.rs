//! Gates, slots and port ranges

use crate::GateKeeperError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// A public bind point an agent can be given
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gate {
    pub host: String,
    pub port: u16,
}

impl Gate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Coordination store key reserving this gate
    pub fn store_key(&self) -> String {
        format!("slot/{}/{}", self.host, self.port)
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bind_address())
    }
}

/// A gate leased to one agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentSlot {
    pub host: String,
    pub port: u16,
    #[serde(rename = "agentID")]
    pub agent_id: String,
}

impl AgentSlot {
    pub fn new(gate: Gate, agent_id: impl Into<String>) -> Self {
        Self {
            host: gate.host,
            port: gate.port,
            agent_id: agent_id.into(),
        }
    }

    pub fn gate(&self) -> Gate {
        Gate::new(self.host.clone(), self.port)
    }

    pub fn store_key(&self) -> String {
        self.gate().store_key()
    }
}

impl fmt::Display for AgentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.gate(), self.agent_id)
    }
}

/// Inclusive port range, always normalized so `low <= high`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    low: u16,
    high: u16,
}

impl PortRange {
    pub fn new(a: u16, b: u16) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn low(&self) -> u16 {
        self.low
    }

    pub fn high(&self) -> u16 {
        self.high
    }

    pub fn len(&self) -> usize {
        (self.high - self.low) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.low..=self.high
    }
}

impl FromStr for PortRange {
    type Err = GateKeeperError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || GateKeeperError::InvalidPortRange(raw.to_string());

        let (low, high) = raw.trim().split_once('-').ok_or_else(invalid)?;
        let low: u16 = low.trim().parse().map_err(|_| invalid())?;
        let high: u16 = high.trim().parse().map_err(|_| invalid())?;

        Ok(Self::new(low, high))
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        let range: PortRange = "31240-65535".parse().unwrap();
        assert_eq!(range.low(), 31240);
        assert_eq!(range.high(), 65535);
        assert_eq!(range.len(), 65535 - 31240 + 1);
    }

    #[test]
    fn test_parse_port_range_normalizes_order() {
        let range: PortRange = "31242-31240".parse().unwrap();
        assert_eq!(range, PortRange::new(31240, 31242));
        assert_eq!(range.to_string(), "31240-31242");
    }

    #[test]
    fn test_parse_port_range_single_port() {
        let range: PortRange = "8000-8000".parse().unwrap();
        assert_eq!(range.len(), 1);
        assert!(range.contains(8000));
        assert!(!range.contains(8001));
    }

    #[test]
    fn test_parse_port_range_invalid() {
        for raw in ["", "31240", "a-b", "1-2-3", "1-70000", "-5"] {
            assert!(
                matches!(
                    raw.parse::<PortRange>(),
                    Err(GateKeeperError::InvalidPortRange(_))
                ),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_store_key_format() {
        let slot = AgentSlot::new(Gate::new("10.0.0.1", 31240), "foo");
        assert_eq!(slot.store_key(), "slot/10.0.0.1/31240");
        assert_eq!(slot.gate().bind_address(), "10.0.0.1:31240");
    }

    #[test]
    fn test_ipv6_bind_address() {
        let gate = Gate::new("::1", 31240);
        assert_eq!(gate.bind_address(), "[::1]:31240");
    }
}
