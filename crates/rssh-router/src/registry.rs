//! Subdomain -> tunnel table

use crate::tunnel::Tunnel;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Subdomain {subdomain} is already served by agent {agent_id}")]
    SubdomainInUse { subdomain: String, agent_id: String },

    #[error("No tunnel for subdomain {0}")]
    NotFound(String),
}

/// Live tunnels by subdomain
///
/// Each operation holds the lock of the shard its key lives in, so a lookup
/// never sees a tunnel after its deregistration returned, and lookups of
/// unrelated subdomains rarely contend.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tunnel` reachable under `subdomain`
    pub fn register(&self, subdomain: &str, tunnel: Arc<Tunnel>) -> Result<(), RegistryError> {
        match self.tunnels.entry(subdomain.to_string()) {
            Entry::Occupied(existing) => {
                let agent_id = existing.get().agent_id().to_string();
                error!(
                    "Subdomain {} already served by agent {}, refusing tunnel of agent {}",
                    subdomain,
                    agent_id,
                    tunnel.agent_id()
                );
                Err(RegistryError::SubdomainInUse {
                    subdomain: subdomain.to_string(),
                    agent_id,
                })
            }
            Entry::Vacant(slot) => {
                debug!("Registered tunnel {} -> {}", subdomain, tunnel.slot());
                slot.insert(tunnel);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, subdomain: &str) -> Result<Arc<Tunnel>, RegistryError> {
        trace!("Looking up tunnel for {}", subdomain);
        self.tunnels
            .get(subdomain)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(subdomain.to_string()))
    }

    /// Remove whatever tunnel serves `subdomain`; a no-op when there is none
    pub fn deregister(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        let removed = self.tunnels.remove(subdomain).map(|(_, tunnel)| tunnel);
        if removed.is_some() {
            debug!("Deregistered tunnel {}", subdomain);
        }
        removed
    }

    /// Remove `tunnel` only if it is still the one registered under its subdomain
    pub fn deregister_tunnel(&self, tunnel: &Arc<Tunnel>) -> bool {
        let removed = self
            .tunnels
            .remove_if(tunnel.subdomain(), |_, current| Arc::ptr_eq(current, tunnel))
            .is_some();
        if removed {
            debug!("Deregistered tunnel {}", tunnel.subdomain());
        }
        removed
    }

    pub fn contains(&self, subdomain: &str) -> bool {
        self.tunnels.contains_key(subdomain)
    }

    /// Registered subdomains, sorted
    pub fn subdomains(&self) -> Vec<String> {
        let mut subdomains: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        subdomains.sort();
        subdomains
    }

    pub fn count(&self) -> usize {
        self.tunnels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::tests::echo_tunnel;

    #[test]
    fn test_register_and_lookup() {
        let registry = TunnelRegistry::new();
        let tunnel = Arc::new(echo_tunnel("foo", 1));

        registry.register("foo.example.com", tunnel.clone()).unwrap();

        let found = registry.lookup("foo.example.com").unwrap();
        assert!(Arc::ptr_eq(&found, &tunnel));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_deregister_then_lookup() {
        let registry = TunnelRegistry::new();
        registry
            .register("foo.example.com", Arc::new(echo_tunnel("foo", 1)))
            .unwrap();

        assert!(registry.deregister("foo.example.com").is_some());
        assert!(matches!(
            registry.lookup("foo.example.com"),
            Err(RegistryError::NotFound(_))
        ));
        // Idempotent
        assert!(registry.deregister("foo.example.com").is_none());
    }

    #[test]
    fn test_register_occupied_subdomain() {
        let registry = TunnelRegistry::new();
        registry
            .register("foo.example.com", Arc::new(echo_tunnel("foo", 1)))
            .unwrap();

        let result = registry.register("foo.example.com", Arc::new(echo_tunnel("bar", 1)));
        match result {
            Err(RegistryError::SubdomainInUse { agent_id, .. }) => assert_eq!(agent_id, "foo"),
            other => panic!("expected SubdomainInUse, got {:?}", other),
        }
    }

    #[test]
    fn test_deregister_tunnel_ignores_replacement() {
        let registry = TunnelRegistry::new();
        let old = Arc::new(echo_tunnel("foo", 1));
        let new = Arc::new(echo_tunnel("foo", 1));

        registry.register("foo.example.com", old.clone()).unwrap();
        assert!(registry.deregister_tunnel(&old));
        registry.register("foo.example.com", new.clone()).unwrap();

        assert!(!registry.deregister_tunnel(&old));
        assert!(Arc::ptr_eq(&registry.lookup("foo.example.com").unwrap(), &new));
    }

    #[test]
    fn test_subdomains_sorted() {
        let registry = TunnelRegistry::new();
        for name in ["b", "c", "a"] {
            registry
                .register(&format!("{}.example.com", name), Arc::new(echo_tunnel(name, 1)))
                .unwrap();
        }

        assert_eq!(
            registry.subdomains(),
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_single_winner() {
        let registry = Arc::new(TunnelRegistry::new());

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let tunnel = Arc::new(echo_tunnel(&format!("agent-{}", i), 1));
                registry.register("shared.example.com", tunnel).is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
