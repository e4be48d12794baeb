//! Gate allocation against the coordination store

use crate::gate::{AgentSlot, Gate, PortRange};
use crate::retry::RetryPolicy;
use crate::GateKeeperError;
use dashmap::DashMap;
use rssh_store::{SlotStore, StoreError, StoreResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Gatekeeper configuration
#[derive(Debug, Clone)]
pub struct GateKeeperConfig {
    /// Public hosts agents can be bound on, tried in order
    pub hosts: Vec<String>,
    pub port_range: PortRange,
    /// Lease length of every reservation; holders must renew before it runs out
    pub lease_ttl: Duration,
    pub retry: RetryPolicy,
}

impl GateKeeperConfig {
    pub fn new(hosts: Vec<String>, port_range: PortRange) -> Self {
        Self {
            hosts,
            port_range,
            lease_ttl: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Allocates gates to agents
///
/// Uniqueness of a reservation comes from the store's compare-and-swap, never
/// from local state: several gatekeepers in different processes may share a
/// store. The local maps only remember what this instance holds so it can skip
/// its own gates and release a reconnecting agent's previous slot.
pub struct GateKeeper {
    config: GateKeeperConfig,
    store: Arc<dyn SlotStore>,
    /// agent_id -> slot held through this instance
    held: DashMap<String, AgentSlot>,
    /// gate -> agent_id, mirror of `held`
    held_gates: DashMap<Gate, String>,
}

impl GateKeeper {
    pub fn new(config: GateKeeperConfig, store: Arc<dyn SlotStore>) -> Result<Self, GateKeeperError> {
        if config.hosts.is_empty() {
            return Err(GateKeeperError::NoHosts);
        }

        info!(
            "Gatekeeper managing ports {} on {} host(s) ({} gates, lease TTL {}s)",
            config.port_range,
            config.hosts.len(),
            config.port_range.len() * config.hosts.len(),
            config.lease_ttl.as_secs()
        );

        Ok(Self {
            config,
            store,
            held: DashMap::new(),
            held_gates: DashMap::new(),
        })
    }

    pub fn config(&self) -> &GateKeeperConfig {
        &self.config
    }

    pub fn lease_ttl(&self) -> Duration {
        self.config.lease_ttl
    }

    /// Reserve the lowest free gate for `agent_id`
    ///
    /// A slot this instance still holds for the same agent is released first.
    pub async fn allocate_agent_slot(&self, agent_id: &str) -> Result<AgentSlot, GateKeeperError> {
        self.allocate_agent_slot_excluding(agent_id, &[]).await
    }

    /// Like [`GateKeeper::allocate_agent_slot`], never handing out a gate in `exclude`
    ///
    /// Used when a gate turned out to be unbindable on this host.
    pub async fn allocate_agent_slot_excluding(
        &self,
        agent_id: &str,
        exclude: &[Gate],
    ) -> Result<AgentSlot, GateKeeperError> {
        if let Some((_, previous)) = self.held.remove(agent_id) {
            info!(
                "Agent {} still holds {}, releasing it before reallocating",
                agent_id,
                previous.gate()
            );
            self.held_gates.remove(&previous.gate());
            if let Err(e) = self.delete_record(&previous).await {
                warn!(
                    "Failed to release previous slot {} (left to lease expiry): {}",
                    previous, e
                );
            }
        }

        for host in &self.config.hosts {
            for port in self.config.port_range.ports() {
                let gate = Gate::new(host.clone(), port);
                if self.held_gates.contains_key(&gate) || exclude.contains(&gate) {
                    continue;
                }

                if self.try_reserve(&gate, agent_id).await? {
                    let slot = AgentSlot::new(gate.clone(), agent_id);
                    self.held_gates.insert(gate, agent_id.to_string());
                    self.held.insert(agent_id.to_string(), slot.clone());
                    info!("Allocated gate {} to agent {}", slot.gate(), agent_id);
                    return Ok(slot);
                }

                trace!("Gate {} is taken, trying next", gate);
            }
        }

        warn!(
            "Port pool {} exhausted, rejecting agent {}",
            self.config.port_range, agent_id
        );
        Err(GateKeeperError::PoolExhausted {
            low: self.config.port_range.low(),
            high: self.config.port_range.high(),
        })
    }

    /// Release `slot` if the store still records it for the same agent
    ///
    /// Releasing an already released or reassigned slot is a no-op.
    pub async fn release_agent_slot(&self, slot: &AgentSlot) -> Result<(), GateKeeperError> {
        self.forget(slot);

        match self.delete_record(slot).await {
            Ok(true) => {
                info!("Released gate {} from agent {}", slot.gate(), slot.agent_id);
                Ok(())
            }
            Ok(false) => {
                debug!("Slot {} was already released", slot);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to release slot {}, it will be reclaimed on lease expiry: {}",
                    slot, e
                );
                Err(e.into())
            }
        }
    }

    /// Extend the lease on `slot`
    ///
    /// Fails with [`GateKeeperError::SlotNotOwned`] when the record expired or
    /// now belongs to someone else; the holder must tear its tunnel down.
    pub async fn renew_lease(&self, slot: &AgentSlot) -> Result<(), GateKeeperError> {
        let key = slot.store_key();
        let ttl = self.config.lease_ttl;

        let renewed = self
            .call("renew", || self.store.renew(&key, &slot.agent_id, ttl))
            .await?;

        if renewed {
            trace!("Renewed lease on {}", slot);
            Ok(())
        } else {
            warn!("Lease on {} was lost", slot);
            self.forget(slot);
            Err(GateKeeperError::SlotNotOwned {
                host: slot.host.clone(),
                port: slot.port,
                agent_id: slot.agent_id.clone(),
            })
        }
    }

    /// Agent currently recorded for `gate`, from the store
    pub async fn holder(&self, gate: &Gate) -> Result<Option<String>, GateKeeperError> {
        let key = gate.store_key();
        Ok(self.call("get", || self.store.get(&key)).await?)
    }

    /// Slot this instance holds for `agent_id`
    pub fn held_slot(&self, agent_id: &str) -> Option<AgentSlot> {
        self.held.get(agent_id).map(|s| s.value().clone())
    }

    /// Number of slots held through this instance
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    fn forget(&self, slot: &AgentSlot) {
        self.held.remove_if(&slot.agent_id, |_, held| held == slot);
        self.held_gates
            .remove_if(&slot.gate(), |_, agent| *agent == slot.agent_id);
    }

    async fn delete_record(&self, slot: &AgentSlot) -> StoreResult<bool> {
        let key = slot.store_key();
        self.call("release", || {
            self.store.compare_and_delete(&key, &slot.agent_id)
        })
        .await
    }

    /// One compare-and-swap on `gate`, retried on transient failures
    async fn try_reserve(&self, gate: &Gate, agent_id: &str) -> Result<bool, GateKeeperError> {
        let key = gate.store_key();
        let ttl = self.config.lease_ttl;
        let mut backoff = self.config.retry.backoff();
        let mut uncertain = false;

        loop {
            let result = self
                .timed(self.store.compare_and_swap(&key, None, agent_id, ttl))
                .await;

            match result {
                Ok(true) => return Ok(true),
                Ok(false) if uncertain => {
                    // A failed attempt may have been applied before its reply was lost
                    let owner = self.call("get", || self.store.get(&key)).await?;
                    return Ok(owner.as_deref() == Some(agent_id));
                }
                Ok(false) => return Ok(false),
                Err(e) if e.is_transient() => {
                    uncertain = true;
                    debug!(
                        "Reserving {} failed (attempt {}): {}",
                        gate,
                        backoff.attempt() + 1,
                        e
                    );
                    if !backoff.wait().await {
                        error!(
                            "Slot store unreachable while reserving {} after {} attempts: {}",
                            gate,
                            backoff.attempt(),
                            e
                        );
                        return Err(e.into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run a store call with the per-call timeout and bounded retries
    async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut backoff = self.config.retry.backoff();

        loop {
            match self.timed(op()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    debug!(
                        "Slot store {} failed (attempt {}): {}",
                        what,
                        backoff.attempt() + 1,
                        e
                    );
                    if !backoff.wait().await {
                        error!(
                            "Slot store {} failed after {} attempts: {}",
                            what,
                            backoff.attempt(),
                            e
                        );
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn timed<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match timeout(self.config.retry.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "call timed out after {}ms",
                self.config.retry.call_timeout.as_millis()
            ))),
        }
    }
}
