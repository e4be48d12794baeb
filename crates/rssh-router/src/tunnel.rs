//! Tunnel handle and the transport seam it proxies through

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rssh_gatekeeper::AgentSlot;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Tunnel closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One request/response exchange carried by a tunnel
///
/// Bytes written are delivered to the agent's service; bytes read come back
/// from it. Shutting down the write half signals end of request.
pub trait ExchangeStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ExchangeStream for T {}

pub type Exchange = Box<dyn ExchangeStream>;

/// Byte-stream session to an agent
#[async_trait]
pub trait TunnelTransport: Send + Sync + fmt::Debug {
    /// How many exchanges may be in flight at once (at least 1)
    fn max_concurrent_exchanges(&self) -> usize;

    /// Start a new exchange
    async fn open_exchange(&self) -> Result<Exchange, TransportError>;

    /// Resolves once the session is gone, from either side
    async fn closed(&self);

    fn is_closed(&self) -> bool;

    /// Tear the session down
    async fn close(&self);

    /// Time of the most recent traffic, in either direction
    fn last_activity(&self) -> Instant;
}

/// A live tunnel, addressable under one hostname
pub struct Tunnel {
    slot: AgentSlot,
    subdomain: String,
    transport: Arc<dyn TunnelTransport>,
    exchange_permits: Arc<Semaphore>,
    established_at: DateTime<Utc>,
}

impl Tunnel {
    pub fn new(slot: AgentSlot, subdomain: impl Into<String>, transport: Arc<dyn TunnelTransport>) -> Self {
        let capacity = transport.max_concurrent_exchanges().max(1);
        Self {
            slot,
            subdomain: subdomain.into(),
            transport,
            exchange_permits: Arc::new(Semaphore::new(capacity)),
            established_at: Utc::now(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.slot.agent_id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn slot(&self) -> &AgentSlot {
        &self.slot
    }

    pub fn transport(&self) -> &Arc<dyn TunnelTransport> {
        &self.transport
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// How long the tunnel has carried no traffic
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.transport.last_activity())
    }

    /// Open an exchange once the tunnel has room for one
    ///
    /// Waits while the transport's concurrency capability is used up. The
    /// returned permit must be held for the lifetime of the exchange.
    pub async fn open_exchange(&self) -> Result<(Exchange, OwnedSemaphorePermit), TransportError> {
        let permit = tokio::select! {
            permit = self.exchange_permits.clone().acquire_owned() => {
                permit.map_err(|_| TransportError::Closed)?
            }
            _ = self.transport.closed() => return Err(TransportError::Closed),
        };

        let exchange = self.transport.open_exchange().await?;
        Ok((exchange, permit))
    }

    pub async fn close(&self) {
        self.exchange_permits.close();
        self.transport.close().await;
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("subdomain", &self.subdomain)
            .field("slot", &self.slot)
            .field("established_at", &self.established_at)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rssh_gatekeeper::Gate;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Notify;

    /// Transport whose exchanges echo every byte back
    #[derive(Debug)]
    pub(crate) struct EchoTransport {
        capacity: usize,
        opened: AtomicUsize,
        closed: AtomicBool,
        notify: Notify,
    }

    impl EchoTransport {
        pub(crate) fn new(capacity: usize) -> Self {
            Self {
                capacity,
                opened: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl TunnelTransport for EchoTransport {
        fn max_concurrent_exchanges(&self) -> usize {
            self.capacity
        }

        async fn open_exchange(&self) -> Result<Exchange, TransportError> {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let (mut rd, mut wr) = tokio::io::split(server);
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
            Ok(Box::new(client))
        }

        async fn closed(&self) {
            loop {
                let notified = self.notify.notified();
                if self.is_closed() {
                    return;
                }
                notified.await;
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        fn last_activity(&self) -> Instant {
            Instant::now()
        }
    }

    pub(crate) fn echo_tunnel(agent_id: &str, capacity: usize) -> Tunnel {
        let slot = AgentSlot::new(Gate::new("127.0.0.1", 31240), agent_id);
        Tunnel::new(
            slot,
            format!("{}.example.com", agent_id),
            Arc::new(EchoTransport::new(capacity)),
        )
    }

    #[tokio::test]
    async fn test_exchange_echo() {
        let tunnel = echo_tunnel("foo", 1);

        let (mut exchange, _permit) = tunnel.open_exchange().await.unwrap();
        exchange.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        exchange.shutdown().await.unwrap();

        let mut response = Vec::new();
        exchange.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchanges_gated_by_capability() {
        let tunnel = Arc::new(echo_tunnel("foo", 1));

        let (_first, permit) = tunnel.open_exchange().await.unwrap();

        let waiter = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_exchange().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_closing_wakes_waiting_exchanges() {
        let tunnel = Arc::new(echo_tunnel("foo", 1));
        let (_first, _permit) = tunnel.open_exchange().await.unwrap();

        let waiter = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_exchange().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        tunnel.close().await;

        assert!(matches!(waiter.await.unwrap(), Err(TransportError::Closed)));
        assert!(tunnel.is_closed());
    }
}
