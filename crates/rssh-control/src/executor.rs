//! Control listener and per-agent lifecycles

use crate::lifecycle::{AgentState, LifecycleHandle, LifecycleTracker};
use crate::listener::{AgentListener, ListenerError};
use futures::{SinkExt, StreamExt};
use rssh_auth::{AgentAuthenticator, AllowAllAuthenticator, AuthError};
use rssh_gatekeeper::{AgentSlot, Gate, GateKeeper, GateKeeperConfig, GateKeeperError};
use rssh_proto::{TunnelCodec, TunnelMessage};
use rssh_router::{is_valid_label, tunnel_host, RegistryError, Tunnel, TunnelRegistry};
use rssh_store::SlotStore;
use rssh_transport::{AgentIdHandshake, MessageFramed, TunnelHandshake};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ControlConnection = MessageFramed<TcpStream>;

/// Gates tried per agent before giving up on binding
const MAX_BIND_ATTEMPTS: usize = 3;
/// Upper bound on writing a farewell message to an agent
const NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("{0}")]
    GateKeeper(#[from] GateKeeperError),

    #[error("{0}")]
    Listener(#[from] ListenerError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid subdomain {0:?}")]
    InvalidSubdomain(String),

    #[error("Control connection closed")]
    ControlClosed,

    #[error("Cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Where agents connect to authenticate
    pub control_addr: SocketAddr,
    /// Tunnels are served as `{label}.{root_domain}`
    pub root_domain: String,
    /// Port of the public HTTP front door, used in the URLs handed to agents
    pub public_port: u16,
    pub gatekeeper: GateKeeperConfig,
    /// Deadline for the agent's hello and for its tunnel connection
    pub handshake_timeout: Duration,
    /// Tunnels without traffic for this long are closed
    pub idle_timeout: Duration,
}

impl ExecutorConfig {
    pub fn new(root_domain: impl Into<String>, gatekeeper: GateKeeperConfig) -> Self {
        Self {
            control_addr: SocketAddr::from(([0, 0, 0, 0], 2222)),
            root_domain: root_domain.into(),
            public_port: 8080,
            gatekeeper,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_control_addr(mut self, addr: SocketAddr) -> Self {
        self.control_addr = addr;
        self
    }

    pub fn with_public_port(mut self, port: u16) -> Self {
        self.public_port = port;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Drives every agent from hello to released slot
pub struct Executor {
    config: ExecutorConfig,
    gatekeeper: Arc<GateKeeper>,
    registry: Arc<TunnelRegistry>,
    authenticator: Arc<dyn AgentAuthenticator>,
    handshake: Arc<dyn TunnelHandshake>,
    lifecycles: LifecycleTracker,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        store: Arc<dyn SlotStore>,
        registry: Arc<TunnelRegistry>,
    ) -> Result<Self, ExecutorError> {
        let gatekeeper = GateKeeper::new(config.gatekeeper.clone(), store)?;
        Ok(Self {
            config,
            gatekeeper: Arc::new(gatekeeper),
            registry,
            authenticator: Arc::new(AllowAllAuthenticator),
            handshake: Arc::new(AgentIdHandshake),
            lifecycles: LifecycleTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn AgentAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn TunnelHandshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn root_domain(&self) -> &str {
        &self.config.root_domain
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn gatekeeper(&self) -> &Arc<GateKeeper> {
        &self.gatekeeper
    }

    /// Agents with a running lifecycle and where each one is
    pub fn active_agents(&self) -> Vec<(String, AgentState)> {
        self.lifecycles.snapshot()
    }

    pub fn lifecycle(&self, agent_id: &str) -> Option<LifecycleHandle> {
        self.lifecycles.get(agent_id)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting agents and wait until every lifecycle released its slot
    pub async fn shutdown(&self) {
        info!("Shutting down, closing {} agent(s)", self.lifecycles.len());
        self.shutdown.cancel();
        for handle in self.lifecycles.handles() {
            handle.released().await;
        }
    }

    pub async fn bind_control(&self) -> Result<TcpListener, ExecutorError> {
        let addr = self.config.control_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|e| ExecutorError::Bind {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })
    }

    /// Bind the control port and serve agents until shutdown
    pub async fn run(self: Arc<Self>) -> Result<(), ExecutorError> {
        let listener = self.bind_control().await?;
        self.serve(listener).await
    }

    /// Serve agents on an already bound control listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ExecutorError> {
        info!("Control listener on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Control listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Control connection from {}", peer_addr);
                        let executor = self.clone();
                        tokio::spawn(async move {
                            executor.handle_control_connection(stream, peer_addr).await;
                        });
                    }
                    Err(e) => error!("Failed to accept control connection: {}", e),
                }
            }
        }
    }

    fn public_url(&self, host: &str) -> String {
        match self.config.public_port {
            80 => format!("http://{}", host),
            port => format!("http://{}:{}", host, port),
        }
    }

    async fn handle_control_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut control = Framed::new(stream, TunnelCodec);

        let (agent_id, token, alias) =
            match timeout(self.config.handshake_timeout, control.next()).await {
                Ok(Some(Ok(TunnelMessage::Hello {
                    agent_id,
                    token,
                    subdomain,
                }))) => (agent_id, token, subdomain),
                Ok(Some(Ok(other))) => {
                    debug!("Expected Hello from {}, got {:?}", peer_addr, other);
                    reject(&mut control, "expected Hello").await;
                    return;
                }
                Ok(Some(Err(e))) => {
                    debug!("Unreadable hello from {}: {}", peer_addr, e);
                    return;
                }
                Ok(None) => return,
                Err(_) => {
                    debug!("No hello from {} within {:?}", peer_addr, self.config.handshake_timeout);
                    return;
                }
            };

        if let Err(e) = self.authenticator.authenticate(&agent_id, &token).await {
            warn!("Rejecting agent {} from {}: {}", agent_id, peer_addr, e);
            reject(&mut control, &format!("authentication failed: {}", e)).await;
            return;
        }

        let label = alias.unwrap_or_else(|| agent_id.clone());
        if !is_valid_label(&label) {
            reject(&mut control, &ExecutorError::InvalidSubdomain(label).to_string()).await;
            return;
        }
        let subdomain = tunnel_host(&label, &self.config.root_domain);

        let cancel = self.shutdown.child_token();
        let (handle, state) = LifecycleHandle::new(cancel.clone());
        let lifecycle_id = handle.id();

        if let Some(previous) = self.lifecycles.register(&agent_id, handle) {
            info!("Agent {} reconnected, replacing its previous tunnel", agent_id);
            previous.cancel();
            previous.released().await;
        }

        let mut session = AgentSession {
            executor: self,
            agent_id: agent_id.clone(),
            subdomain,
            state,
            slot: None,
            listener: None,
            tunnel: None,
            registered: false,
            assigned: false,
        };

        let reason = match session.run(&mut control, &cancel).await {
            Ok(reason) => reason,
            Err(e) => e.to_string(),
        };
        session.close(&mut control, &reason).await;

        self.lifecycles.unregister(&agent_id, lifecycle_id);
    }
}

/// Progress of one agent, so teardown knows what to undo
struct AgentSession<'a> {
    executor: &'a Executor,
    agent_id: String,
    subdomain: String,
    state: watch::Sender<AgentState>,
    slot: Option<AgentSlot>,
    listener: Option<AgentListener>,
    tunnel: Option<Arc<Tunnel>>,
    registered: bool,
    /// SlotAssigned was sent to the agent
    assigned: bool,
}

impl AgentSession<'_> {
    fn enter(&self, next: AgentState) {
        let current = *self.state.borrow();
        if current.can_transition_to(next) {
            self.state.send_replace(next);
            debug!("Agent {}: {} -> {}", self.agent_id, current, next);
        }
    }

    /// Run until the tunnel should close; returns why
    async fn run(
        &mut self,
        control: &mut ControlConnection,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        let executor = self.executor;
        let registry = &executor.registry;
        if let Ok(existing) = registry.lookup(&self.subdomain) {
            if existing.agent_id() != self.agent_id {
                return Err(RegistryError::SubdomainInUse {
                    subdomain: self.subdomain.clone(),
                    agent_id: existing.agent_id().to_string(),
                }
                .into());
            }
        }

        let slot = self.allocate_and_listen().await?;

        let url = executor.public_url(&self.subdomain);
        control
            .send(TunnelMessage::SlotAssigned {
                host: slot.host.clone(),
                port: slot.port,
                subdomain: self.subdomain.clone(),
                public_url: url.clone(),
            })
            .await
            .map_err(|e| ExecutorError::Protocol(e.to_string()))?;
        self.assigned = true;

        let tunnel = Arc::new(self.wait_for_tunnel(control, cancel).await?);
        self.tunnel = Some(tunnel.clone());

        registry.register(&self.subdomain, tunnel.clone())?;
        self.registered = true;
        self.enter(AgentState::TunnelActive);
        info!("🚇 Agent {} is live at {} via {}", self.agent_id, url, slot.gate());

        self.serve(control, cancel, &tunnel, &slot).await
    }

    async fn allocate_and_listen(&mut self) -> Result<AgentSlot, ExecutorError> {
        let executor = self.executor;
        let mut unbindable: Vec<Gate> = Vec::new();

        loop {
            let slot = executor
                .gatekeeper
                .allocate_agent_slot_excluding(&self.agent_id, &unbindable)
                .await?;
            self.slot = Some(slot.clone());
            self.enter(AgentState::SlotAllocated);

            let listener = AgentListener::new(
                slot.clone(),
                self.subdomain.clone(),
                executor.config.handshake_timeout,
            )
            .with_handshake(executor.handshake.clone());

            match listener.listen().await {
                Ok(_) => {
                    self.listener = Some(listener);
                    return Ok(slot);
                }
                Err(e @ ListenerError::Bind { .. }) if unbindable.len() + 1 < MAX_BIND_ATTEMPTS => {
                    warn!("Gate {} cannot be bound, trying another: {}", slot.gate(), e);
                    self.slot = None;
                    let _ = executor.gatekeeper.release_agent_slot(&slot).await;
                    unbindable.push(slot.gate());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn wait_for_tunnel(
        &self,
        control: &mut ControlConnection,
        cancel: &CancellationToken,
    ) -> Result<Tunnel, ExecutorError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| ExecutorError::Protocol("no listener".to_string()))?;

        let start = listener.start();
        tokio::pin!(start);

        loop {
            tokio::select! {
                result = &mut start => return Ok(result?),
                message = control.next() => {
                    if !answer_control(control, message).await {
                        return Err(ExecutorError::ControlClosed);
                    }
                }
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
            }
        }
    }

    async fn serve(
        &self,
        control: &mut ControlConnection,
        cancel: &CancellationToken,
        tunnel: &Arc<Tunnel>,
        slot: &AgentSlot,
    ) -> Result<String, ExecutorError> {
        let gatekeeper = &self.executor.gatekeeper;
        let idle_timeout = self.executor.config.idle_timeout;

        let renew_every = (gatekeeper.lease_ttl() / 3).max(Duration::from_millis(10));
        let mut renew = interval_at(Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let idle_every = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(5));
        let mut idle_check = interval_at(Instant::now() + idle_every, idle_every);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = control.next() => {
                    if !answer_control(control, message).await {
                        return Ok("control connection closed".to_string());
                    }
                }
                _ = tunnel.transport().closed() => {
                    return Ok("tunnel connection closed".to_string());
                }
                _ = cancel.cancelled() => {
                    return Err(ExecutorError::Cancelled);
                }
                _ = renew.tick() => match gatekeeper.renew_lease(slot).await {
                    Ok(()) => {}
                    Err(e @ GateKeeperError::SlotNotOwned { .. }) => return Err(e.into()),
                    Err(e) => warn!("Lease renewal for {} failed, retrying next period: {}", slot, e),
                },
                _ = idle_check.tick() => {
                    let idle = tunnel.idle_for();
                    if idle >= idle_timeout {
                        info!("Tunnel {} idle for {:?}, closing", self.subdomain, idle);
                        return Ok(format!("idle for {}s", idle.as_secs()));
                    }
                }
            }
        }
    }

    /// Deregister, release, stop; then tell the agent
    async fn close(mut self, control: &mut ControlConnection, reason: &str) {
        self.enter(AgentState::Closing);
        let executor = self.executor;

        if self.registered {
            if let Some(tunnel) = &self.tunnel {
                executor.registry.deregister_tunnel(tunnel);
            }
        }

        if let Some(slot) = self.slot.take() {
            // Failure is logged by the gatekeeper; the lease expires on its own
            let _ = executor.gatekeeper.release_agent_slot(&slot).await;
        }

        if let Some(listener) = &self.listener {
            listener.stop();
        }

        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }

        let notice = if self.assigned {
            TunnelMessage::Disconnect {
                reason: reason.to_string(),
            }
        } else {
            TunnelMessage::Rejected {
                reason: reason.to_string(),
            }
        };
        let _ = timeout(NOTICE_TIMEOUT, control.send(notice)).await;

        info!("Agent {} released ({})", self.agent_id, reason);
        self.enter(AgentState::Released);
    }
}

/// Handle one control message; `false` once the agent is gone
async fn answer_control(
    control: &mut ControlConnection,
    message: Option<Result<TunnelMessage, rssh_proto::CodecError>>,
) -> bool {
    match message {
        Some(Ok(TunnelMessage::Ping { timestamp })) => {
            control.send(TunnelMessage::Pong { timestamp }).await.is_ok()
        }
        Some(Ok(TunnelMessage::Disconnect { reason })) => {
            debug!("Agent disconnected: {}", reason);
            false
        }
        Some(Ok(other)) => {
            debug!("Ignoring control message {:?}", other);
            true
        }
        Some(Err(e)) => {
            debug!("Control connection error: {}", e);
            false
        }
        None => false,
    }
}

async fn reject(control: &mut ControlConnection, reason: &str) {
    let message = TunnelMessage::Rejected {
        reason: reason.to_string(),
    };
    let _ = timeout(NOTICE_TIMEOUT, control.send(message)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rssh_gatekeeper::PortRange;
    use rssh_store::MemorySlotStore;

    fn executor(public_port: u16) -> Executor {
        let gatekeeper = GateKeeperConfig::new(vec!["127.0.0.1".to_string()], PortRange::new(1, 2));
        let config = ExecutorConfig::new("example.com", gatekeeper).with_public_port(public_port);
        Executor::new(
            config,
            Arc::new(MemorySlotStore::new()),
            Arc::new(TunnelRegistry::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_public_url() {
        assert_eq!(
            executor(80).public_url("foo.example.com"),
            "http://foo.example.com"
        );
        assert_eq!(
            executor(8080).public_url("foo.example.com"),
            "http://foo.example.com:8080"
        );
    }

    #[test]
    fn test_requires_gate_hosts() {
        let gatekeeper = GateKeeperConfig::new(vec![], PortRange::new(1, 2));
        let result = Executor::new(
            ExecutorConfig::new("example.com", gatekeeper),
            Arc::new(MemorySlotStore::new()),
            Arc::new(TunnelRegistry::new()),
        );
        assert!(matches!(
            result,
            Err(ExecutorError::GateKeeper(GateKeeperError::NoHosts))
        ));
    }
}
