//! Per-slot listener accepting an agent's tunnel connection

use rssh_gatekeeper::AgentSlot;
use rssh_proto::TunnelCodec;
use rssh_router::{TransportError, Tunnel};
use rssh_transport::{AgentIdHandshake, FramedTunnel, TunnelHandshake};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("No tunnel established within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Listener cancelled")]
    Cancelled,

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Tunnel handshake failed: {0}")]
    Handshake(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Listener already used")]
    AlreadyUsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    Established,
    TimedOut,
    Cancelled,
    /// Bind or handshake error
    Failed,
}

impl ListenerState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ListenerState::Idle | ListenerState::Listening)
    }
}

/// Single-use listener for one allocated gate
///
/// Accepts exactly the next connection on the gate and turns it into a
/// [`Tunnel`] once the handshake passes. Every terminal state drops the socket.
pub struct AgentListener {
    slot: AgentSlot,
    subdomain: String,
    handshake_timeout: Duration,
    handshake: Arc<dyn TunnelHandshake>,
    socket: Mutex<Option<TcpListener>>,
    state: watch::Sender<ListenerState>,
    cancel: CancellationToken,
}

impl AgentListener {
    pub fn new(slot: AgentSlot, subdomain: impl Into<String>, handshake_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            slot,
            subdomain: subdomain.into(),
            handshake_timeout,
            handshake: Arc::new(AgentIdHandshake),
            socket: Mutex::new(None),
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn TunnelHandshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn slot(&self) -> &AgentSlot {
        &self.slot
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Bind the gate's socket without accepting yet
    ///
    /// Returns the bound address. Binding early lets the caller tell the agent
    /// where to connect before waiting in [`AgentListener::start`].
    pub async fn listen(&self) -> Result<SocketAddr, ListenerError> {
        let mut socket = self.socket.lock().await;

        if let Some(listener) = socket.as_ref() {
            return Ok(listener.local_addr()?);
        }
        match self.state() {
            ListenerState::Idle => {}
            ListenerState::Cancelled => return Err(ListenerError::Cancelled),
            _ => return Err(ListenerError::AlreadyUsed),
        }

        let gate = self.slot.gate();
        let listener = TcpListener::bind(gate.bind_address()).await.map_err(|e| {
            self.transition(ListenerState::Failed);
            ListenerError::Bind {
                address: gate.host.clone(),
                port: gate.port,
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr()?;

        *socket = Some(listener);
        self.transition(ListenerState::Listening);
        debug!("Gate {} listening for agent {}", local_addr, self.slot.agent_id);

        Ok(local_addr)
    }

    /// Wait for the agent's tunnel connection
    ///
    /// Binds first when [`AgentListener::listen`] was not called.
    pub async fn start(&self) -> Result<Tunnel, ListenerError> {
        if self.cancel.is_cancelled() {
            self.transition(ListenerState::Cancelled);
            return Err(ListenerError::Cancelled);
        }

        self.listen().await?;
        let taken = self.socket.lock().await.take();
        let listener = match taken {
            Some(listener) => listener,
            None if self.cancel.is_cancelled() => return Err(ListenerError::Cancelled),
            None => return Err(ListenerError::AlreadyUsed),
        };

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(ListenerError::Cancelled),
            result = tokio::time::timeout(self.handshake_timeout, self.accept(&listener)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(ListenerError::HandshakeTimeout(self.handshake_timeout)),
                }
            }
        };
        drop(listener);

        match &outcome {
            Ok(_) => {
                self.transition(ListenerState::Established);
                info!(
                    "Tunnel established for agent {} on {}",
                    self.slot.agent_id,
                    self.slot.gate()
                );
            }
            Err(ListenerError::Cancelled) => {
                self.transition(ListenerState::Cancelled);
                debug!("Listener on {} cancelled", self.slot.gate());
            }
            Err(ListenerError::HandshakeTimeout(_)) => {
                self.transition(ListenerState::TimedOut);
                info!(
                    "Agent {} did not connect to {} within {:?}",
                    self.slot.agent_id,
                    self.slot.gate(),
                    self.handshake_timeout
                );
            }
            Err(e) => {
                self.transition(ListenerState::Failed);
                debug!("Listener on {} failed: {}", self.slot.gate(), e);
            }
        }

        outcome
    }

    /// Close the socket; a pending or later [`AgentListener::start`] returns `Cancelled`
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Ok(mut socket) = self.socket.try_lock() {
            socket.take();
        }
        self.transition(ListenerState::Cancelled);
    }

    async fn accept(&self, listener: &TcpListener) -> Result<Tunnel, ListenerError> {
        let (stream, peer_addr) = listener.accept().await?;
        debug!("Gate {} accepted connection from {}", self.slot.gate(), peer_addr);

        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, TunnelCodec);
        self.handshake
            .accept(&mut framed, &self.slot, &self.subdomain)
            .await?;

        let transport = Arc::new(FramedTunnel::new(framed));
        Ok(Tunnel::new(self.slot.clone(), self.subdomain.clone(), transport))
    }

    fn transition(&self, next: ListenerState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use rssh_gatekeeper::Gate;
    use rssh_proto::TunnelMessage;
    use tokio::net::TcpStream;

    fn listener(agent_id: &str, timeout: Duration) -> AgentListener {
        let slot = AgentSlot::new(Gate::new("127.0.0.1", 0), agent_id);
        AgentListener::new(slot, format!("{}.example.com", agent_id), timeout)
    }

    async fn connect_agent(addr: SocketAddr, agent_id: &str) -> Framed<TcpStream, TunnelCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, TunnelCodec);
        framed
            .send(TunnelMessage::TunnelHello {
                agent_id: agent_id.to_string(),
            })
            .await
            .unwrap();
        framed
    }

    #[tokio::test]
    async fn test_establishes_tunnel() {
        let listener = listener("foo", Duration::from_secs(5));
        let addr = listener.listen().await.unwrap();
        assert_eq!(listener.state(), ListenerState::Listening);

        let agent = tokio::spawn(async move {
            let mut framed = connect_agent(addr, "foo").await;
            let reply = framed.next().await.unwrap().unwrap();
            (framed, reply)
        });

        let tunnel = listener.start().await.unwrap();
        let (_framed, reply) = agent.await.unwrap();

        assert_eq!(tunnel.agent_id(), "foo");
        assert_eq!(tunnel.subdomain(), "foo.example.com");
        assert_eq!(
            reply,
            TunnelMessage::TunnelAccepted {
                subdomain: "foo.example.com".to_string()
            }
        );
        assert_eq!(listener.state(), ListenerState::Established);
    }

    #[tokio::test]
    async fn test_socket_closed_after_establishing() {
        let listener = listener("foo", Duration::from_secs(5));
        let addr = listener.listen().await.unwrap();

        let agent = tokio::spawn(async move { connect_agent(addr, "foo").await });
        let _tunnel = listener.start().await.unwrap();
        let _agent = agent.await.unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
        assert!(matches!(
            listener.start().await,
            Err(ListenerError::AlreadyUsed)
        ));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let listener = listener("foo", Duration::from_millis(100));

        let result = listener.start().await;

        assert!(matches!(result, Err(ListenerError::HandshakeTimeout(_))));
        assert_eq!(listener.state(), ListenerState::TimedOut);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_start() {
        let listener = Arc::new(listener("foo", Duration::from_secs(30)));
        listener.listen().await.unwrap();

        let pending = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.start().await })
        };

        let mut state = listener.subscribe();
        state
            .wait_for(|s| *s == ListenerState::Listening)
            .await
            .unwrap();
        tokio::task::yield_now().await;

        listener.stop();

        assert!(matches!(
            pending.await.unwrap(),
            Err(ListenerError::Cancelled)
        ));
        assert_eq!(listener.state(), ListenerState::Cancelled);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let listener = listener("foo", Duration::from_secs(30));
        listener.stop();

        assert!(matches!(
            listener.start().await,
            Err(ListenerError::Cancelled)
        ));
        assert!(matches!(
            listener.listen().await,
            Err(ListenerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_wrong_agent_fails_handshake() {
        let listener = listener("foo", Duration::from_secs(5));
        let addr = listener.listen().await.unwrap();

        let agent = tokio::spawn(async move { connect_agent(addr, "mallory").await });

        let result = listener.start().await;
        let _agent = agent.await.unwrap();

        assert!(matches!(
            result,
            Err(ListenerError::Handshake(TransportError::Rejected(_)))
        ));
        assert_eq!(listener.state(), ListenerState::Failed);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let slot = AgentSlot::new(Gate::new("127.0.0.1", port), "foo");
        let listener = AgentListener::new(slot, "foo.example.com", Duration::from_secs(1));

        assert!(matches!(
            listener.listen().await,
            Err(ListenerError::Bind { .. })
        ));
        assert_eq!(listener.state(), ListenerState::Failed);
    }
}
