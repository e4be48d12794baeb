//! Agent side of the control and tunnel connections

use futures::{SinkExt, StreamExt};
use rssh_proto::{ExchangeId, TunnelCodec, TunnelMessage};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type Connection = Framed<TcpStream, TunnelCodec>;

const CHUNK_SIZE: usize = 32 * 1024;
const EXCHANGE_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Disconnected by server: {0}")]
    Disconnected(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker control address, `host:port`
    pub server_addr: String,
    pub agent_id: String,
    pub token: String,
    /// Local service every exchange is forwarded to
    pub local_addr: String,
    /// Requested alias label
    pub subdomain: Option<String>,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
}

impl AgentConfig {
    pub fn new(
        server_addr: impl Into<String>,
        agent_id: impl Into<String>,
        local_addr: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            agent_id: agent_id.into(),
            token: String::new(),
            local_addr: local_addr.into(),
            subdomain: None,
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

pub struct AgentClient;

impl AgentClient {
    /// Authenticate, take the assigned gate and establish the tunnel
    pub async fn connect(config: AgentConfig) -> Result<AgentConnection, AgentError> {
        info!("Connecting to {} as agent {}", config.server_addr, config.agent_id);

        let stream = connect_tcp(&config.server_addr, config.connect_timeout).await?;
        let server_ip = stream.peer_addr()?.ip();
        let mut control = Framed::new(stream, TunnelCodec);

        control
            .send(TunnelMessage::Hello {
                agent_id: config.agent_id.clone(),
                token: config.token.clone(),
                subdomain: config.subdomain.clone(),
            })
            .await
            .map_err(|e| AgentError::Protocol(e.to_string()))?;

        let (host, port, subdomain, public_url) =
            match receive(&mut control, config.connect_timeout, "slot assignment").await? {
                TunnelMessage::SlotAssigned {
                    host,
                    port,
                    subdomain,
                    public_url,
                } => (host, port, subdomain, public_url),
                TunnelMessage::Rejected { reason } => return Err(AgentError::Rejected(reason)),
                other => {
                    return Err(AgentError::Protocol(format!(
                        "expected SlotAssigned, got {:?}",
                        other
                    )))
                }
            };

        let gate = gate_address(&host, port, server_ip);
        debug!("Assigned gate {} ({}:{})", gate, host, port);

        let stream = connect_tcp(&gate, config.connect_timeout).await?;
        let mut tunnel = Framed::new(stream, TunnelCodec);
        tunnel
            .send(TunnelMessage::TunnelHello {
                agent_id: config.agent_id.clone(),
            })
            .await
            .map_err(|e| AgentError::Protocol(e.to_string()))?;

        match receive(&mut tunnel, config.connect_timeout, "tunnel handshake").await? {
            TunnelMessage::TunnelAccepted { .. } => {}
            TunnelMessage::Rejected { reason } => return Err(AgentError::Rejected(reason)),
            other => {
                return Err(AgentError::Protocol(format!(
                    "expected TunnelAccepted, got {:?}",
                    other
                )))
            }
        }

        info!("✅ Tunnel established: {} -> {}", public_url, config.local_addr);

        Ok(AgentConnection {
            config,
            control,
            tunnel,
            subdomain,
            public_url,
            gate,
        })
    }
}

/// An established agent, ready to serve exchanges
pub struct AgentConnection {
    config: AgentConfig,
    control: Connection,
    tunnel: Connection,
    subdomain: String,
    public_url: String,
    gate: String,
}

/// What an exchange task receives from the tunnel
#[derive(Debug)]
enum ExchangeInput {
    Data(Vec<u8>),
    End,
}

impl AgentConnection {
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn gate(&self) -> &str {
        &self.gate
    }

    /// Serve exchanges until the server goes away
    pub async fn run(self) -> Result<(), AgentError> {
        self.run_until(CancellationToken::new()).await
    }

    /// Serve exchanges until the server goes away or `shutdown` fires
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let AgentConnection {
            config,
            mut control,
            mut tunnel,
            ..
        } = self;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<TunnelMessage>(EXCHANGE_BUFFER);
        let mut exchanges: HashMap<ExchangeId, mpsc::Sender<ExchangeInput>> = HashMap::new();

        let period = config.ping_interval.max(Duration::from_millis(10));
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Agent {} shutting down", config.agent_id);
                    let _ = control
                        .send(TunnelMessage::Disconnect { reason: "agent shutting down".to_string() })
                        .await;
                    return Ok(());
                }
                frame = tunnel.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(AgentError::Protocol(e.to_string())),
                        None => return Err(AgentError::Disconnected("tunnel closed".to_string())),
                    };
                    match message {
                        TunnelMessage::ExchangeOpen { exchange_id } => {
                            exchanges.retain(|_, tx| !tx.is_closed());
                            let (tx, rx) = mpsc::channel(EXCHANGE_BUFFER);
                            exchanges.insert(exchange_id, tx);
                            tokio::spawn(serve_exchange(
                                exchange_id,
                                config.local_addr.clone(),
                                rx,
                                outgoing_tx.clone(),
                            ));
                        }
                        TunnelMessage::ExchangeData { exchange_id, data } => {
                            route(&mut exchanges, exchange_id, ExchangeInput::Data(data)).await;
                        }
                        TunnelMessage::ExchangeEnd { exchange_id } => {
                            route(&mut exchanges, exchange_id, ExchangeInput::End).await;
                        }
                        TunnelMessage::ExchangeAbort { exchange_id } => {
                            trace!("Exchange {} aborted by server", exchange_id);
                            exchanges.remove(&exchange_id);
                        }
                        TunnelMessage::Ping { timestamp } => {
                            tunnel
                                .send(TunnelMessage::Pong { timestamp })
                                .await
                                .map_err(|e| AgentError::Protocol(e.to_string()))?;
                        }
                        TunnelMessage::Pong { .. } => {}
                        other => warn!("Unexpected message on tunnel: {:?}", other),
                    }
                }
                frame = control.next() => match frame {
                    Some(Ok(TunnelMessage::Disconnect { reason })) => {
                        return Err(AgentError::Disconnected(reason));
                    }
                    Some(Ok(TunnelMessage::Ping { timestamp })) => {
                        let _ = control.send(TunnelMessage::Pong { timestamp }).await;
                    }
                    Some(Ok(TunnelMessage::Pong { .. })) => {}
                    Some(Ok(other)) => debug!("Ignoring control message {:?}", other),
                    Some(Err(e)) => return Err(AgentError::Protocol(e.to_string())),
                    None => return Err(AgentError::Disconnected("control connection closed".to_string())),
                },
                Some(message) = outgoing_rx.recv() => {
                    tunnel
                        .send(message)
                        .await
                        .map_err(|e| AgentError::Protocol(e.to_string()))?;
                }
                _ = ping.tick() => {
                    let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                    control
                        .send(TunnelMessage::Ping { timestamp })
                        .await
                        .map_err(|e| AgentError::Protocol(e.to_string()))?;
                    tunnel
                        .send(TunnelMessage::Ping { timestamp })
                        .await
                        .map_err(|e| AgentError::Protocol(e.to_string()))?;
                }
            }
        }
    }
}

async fn route(
    exchanges: &mut HashMap<ExchangeId, mpsc::Sender<ExchangeInput>>,
    exchange_id: ExchangeId,
    input: ExchangeInput,
) {
    let delivered = match exchanges.get(&exchange_id) {
        Some(tx) => tx.send(input).await.is_ok(),
        None => {
            trace!("Frame for finished exchange {} dropped", exchange_id);
            return;
        }
    };
    if !delivered {
        exchanges.remove(&exchange_id);
    }
}

/// Forward one exchange to the local service
async fn serve_exchange(
    exchange_id: ExchangeId,
    local_addr: String,
    mut input: mpsc::Receiver<ExchangeInput>,
    output: mpsc::Sender<TunnelMessage>,
) {
    let local = match TcpStream::connect(&local_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Local service {} unavailable: {}", local_addr, e);
            let _ = output.send(TunnelMessage::ExchangeAbort { exchange_id }).await;
            return;
        }
    };
    let (mut local_read, mut local_write) = local.into_split();

    // Ok(false) when the server dropped the exchange
    let upstream = async {
        while let Some(input) = input.recv().await {
            match input {
                ExchangeInput::Data(data) => local_write.write_all(&data).await?,
                ExchangeInput::End => {
                    local_write.shutdown().await?;
                    return Ok(true);
                }
            }
        }
        Ok::<bool, io::Error>(false)
    };

    let downstream = async {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let n = local_read.read(&mut buffer).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            output
                .send(TunnelMessage::ExchangeData {
                    exchange_id,
                    data: buffer[..n].to_vec(),
                })
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tunnel gone"))?;
        }
    };

    tokio::pin!(upstream, downstream);

    let finished = tokio::select! {
        result = &mut downstream => result.is_ok(),
        result = &mut upstream => match result {
            Ok(true) => downstream.await.is_ok(),
            Ok(false) => return,
            Err(e) => {
                debug!("Exchange {} write to local service failed: {}", exchange_id, e);
                false
            }
        },
    };

    let last = if finished {
        TunnelMessage::ExchangeEnd { exchange_id }
    } else {
        TunnelMessage::ExchangeAbort { exchange_id }
    };
    let _ = output.send(last).await;
}

/// Where to reach the gate; unspecified hosts mean "the server itself"
fn gate_address(host: &str, port: u16, server_ip: IpAddr) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => SocketAddr::new(server_ip, port).to_string(),
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{}:{}", host, port),
    }
}

async fn connect_tcp(address: &str, limit: Duration) -> Result<TcpStream, AgentError> {
    let stream = timeout(limit, TcpStream::connect(address))
        .await
        .map_err(|_| AgentError::Timeout(format!("connecting to {}", address)))?
        .map_err(|e| AgentError::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

async fn receive(
    connection: &mut Connection,
    limit: Duration,
    waiting_for: &str,
) -> Result<TunnelMessage, AgentError> {
    match timeout(limit, connection.next()).await {
        Ok(Some(Ok(message))) => Ok(message),
        Ok(Some(Err(e))) => Err(AgentError::Protocol(e.to_string())),
        Ok(None) => Err(AgentError::Disconnected(format!(
            "connection closed while waiting for {}",
            waiting_for
        ))),
        Err(_) => Err(AgentError::Timeout(format!("waiting for {}", waiting_for))),
    }
}
