//! HTTP dispatcher: host-header routing into agent tunnels
use rssh_control::Executor;
use rssh_router::{route_host, Exchange, TunnelRegistry};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub bind_addr: SocketAddr,
    /// Only hosts one label below this domain are routed
    pub root_domain: String,
    /// Requests whose head does not fit are rejected
    pub max_head_size: usize,
    /// Deadline for a client to send its request head
    pub head_timeout: Duration,
    /// How long a request waits for the tunnel to have room for another
    /// exchange before it is answered `503`
    pub exchange_timeout: Duration,
}

impl DispatcherConfig {
    pub fn new(bind_addr: SocketAddr, root_domain: impl Into<String>) -> Self {
        Self {
            bind_addr,
            root_domain: root_domain.into(),
            max_head_size: 16 * 1024,
            head_timeout: Duration::from_secs(30),
            exchange_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }
}

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// Outcome of reading a request head
#[derive(Debug, PartialEq)]
enum Head {
    Complete {
        host: Option<String>,
        request_line: String,
        /// Bytes to send into the tunnel: the rewritten head and any body
        /// bytes read along with it
        forward: Vec<u8>,
    },
    Malformed(&'static str),
    /// Client went away before finishing the head
    Closed,
}

pub struct Dispatcher {
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener, DispatcherError> {
        let addr = self.config.bind_addr;
        TcpListener::bind(addr).await.map_err(|e| DispatcherError::Bind {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        })
    }

    /// Serve the executor's tunnels until it shuts down
    pub async fn run(&self, executor: &Executor) -> Result<(), DispatcherError> {
        let listener = self.bind().await?;
        self.serve(listener, executor.registry().clone(), executor.shutdown_token())
            .await
    }

    pub async fn serve(
        &self,
        listener: TcpListener,
        registry: Arc<TunnelRegistry>,
        shutdown: CancellationToken,
    ) -> Result<(), DispatcherError> {
        info!("HTTP dispatcher listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("HTTP dispatcher stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let registry = registry.clone();
                        let config = self.config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, registry, config).await {
                                debug!("HTTP connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept HTTP connection: {}", e),
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    config: DispatcherConfig,
) -> Result<(), DispatcherError> {
    let _ = stream.set_nodelay(true);
    let mut buffer = Vec::with_capacity(READ_CHUNK);

    let head = match timeout(
        config.head_timeout,
        read_head(&mut stream, &mut buffer, config.max_head_size),
    )
    .await
    {
        Ok(head) => head?,
        Err(_) => {
            debug!("No request head from {} within {:?}", peer_addr, config.head_timeout);
            return Ok(());
        }
    };

    let (host, request_line, forward) = match head {
        Head::Complete {
            host,
            request_line,
            forward,
        } => (host, request_line, forward),
        Head::Malformed(reason) => {
            debug!("Malformed request from {}: {}", peer_addr, reason);
            return respond(&mut stream, 400, "Bad Request", reason).await;
        }
        Head::Closed => return Ok(()),
    };

    let subdomain = match route_host(host.as_deref(), &config.root_domain) {
        Ok(subdomain) => subdomain,
        Err(e) => {
            debug!("Rejecting {} from {}: {}", request_line, peer_addr, e);
            return respond(&mut stream, 400, "Bad Request", &e.to_string()).await;
        }
    };

    trace!("Looking up tunnel for {}", subdomain);
    let tunnel = match registry.lookup(&subdomain) {
        Ok(tunnel) => tunnel,
        Err(_) => {
            debug!("No tunnel for {}", subdomain);
            return respond(&mut stream, 502, "Bad Gateway", "Tunnel not connected").await;
        }
    };

    let (mut exchange, _permit) = match timeout(config.exchange_timeout, tunnel.open_exchange()).await {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => {
            warn!("Failed to open exchange on {}: {}", subdomain, e);
            return respond(&mut stream, 502, "Bad Gateway", "Tunnel error").await;
        }
        Err(_) => {
            warn!(
                "Tunnel {} had no free exchange within {:?}",
                subdomain, config.exchange_timeout
            );
            return respond(&mut stream, 503, "Service Unavailable", "Tunnel busy").await;
        }
    };

    debug!("{} {} via {}", peer_addr, request_line, subdomain);
    exchange.write_all(&forward).await?;

    let (sent, received) = proxy(stream, exchange).await?;
    debug!(
        "Exchange for {} finished ({} bytes up, {} bytes down)",
        subdomain,
        sent + forward.len() as u64,
        received
    );
    Ok(())
}

/// Read until the request head is complete
///
/// Everything read so far, head and any body bytes, stays in `buffer`.
async fn read_head(
    stream: &mut TcpStream,
    buffer: &mut Vec<u8>,
    max_head_size: usize,
) -> io::Result<Head> {
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match parse_head(buffer) {
            Some(head) => return Ok(head),
            None if buffer.len() >= max_head_size => {
                return Ok(Head::Malformed("Request head too large"))
            }
            None => {}
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(Head::Closed);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// `None` while more bytes are needed
fn parse_head(buffer: &[u8]) -> Option<Head> {
    if buffer.is_empty() {
        return None;
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(buffer) {
        Ok(httparse::Status::Partial) => None,
        Ok(httparse::Status::Complete(head_len)) => {
            let mut hosts = request
                .headers
                .iter()
                .filter(|h| h.name.eq_ignore_ascii_case("host"));

            let host = match (hosts.next(), hosts.next()) {
                (None, _) => None,
                (Some(header), None) => match std::str::from_utf8(header.value) {
                    Ok(value) => Some(value.to_string()),
                    Err(_) => return Some(Head::Malformed("Host header is not valid UTF-8")),
                },
                (Some(_), Some(_)) => return Some(Head::Malformed("Multiple Host headers")),
            };

            let request_line = format!(
                "{} {}",
                request.method.unwrap_or("-"),
                request.path.unwrap_or("-")
            );
            let forward = close_delimited(&request, buffer, head_len);
            Some(Head::Complete {
                host,
                request_line,
                forward,
            })
        }
        Err(httparse::Error::TooManyHeaders) => Some(Head::Malformed("Too many headers")),
        Err(_) => Some(Head::Malformed("Malformed request")),
    }
}

/// Request bytes with the head rewritten to `Connection: close`
///
/// A client connection carries exactly one exchange, so the service must end
/// its response by closing; a follow-up request on a kept-alive connection
/// would otherwise skip host routing and hold the exchange open. Upgrade
/// requests are forwarded untouched.
fn close_delimited(request: &httparse::Request<'_, '_>, buffer: &[u8], head_len: usize) -> Vec<u8> {
    let hop_by_hop = |name: &str| {
        ["connection", "keep-alive", "proxy-connection"]
            .iter()
            .any(|hop| name.eq_ignore_ascii_case(hop))
    };
    let upgrade = request.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("connection")
            && String::from_utf8_lossy(h.value)
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
    if upgrade {
        return buffer.to_vec();
    }

    let mut forward = Vec::with_capacity(buffer.len() + 32);
    forward.extend_from_slice(
        format!(
            "{} {} HTTP/1.{}\r\n",
            request.method.unwrap_or("GET"),
            request.path.unwrap_or("/"),
            request.version.unwrap_or(1)
        )
        .as_bytes(),
    );
    for header in request.headers.iter().filter(|h| !hop_by_hop(h.name)) {
        forward.extend_from_slice(header.name.as_bytes());
        forward.extend_from_slice(b": ");
        forward.extend_from_slice(header.value);
        forward.extend_from_slice(b"\r\n");
    }
    forward.extend_from_slice(b"Connection: close\r\n\r\n");
    forward.extend_from_slice(&buffer[head_len..]);
    forward
}

/// Copy both directions until the response ends or either side fails
///
/// The client finishing its request only half-closes the exchange; the
/// response may still be streaming.
async fn proxy(client: TcpStream, exchange: Exchange) -> io::Result<(u64, u64)> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(exchange);

    let upstream = async {
        let n = tokio::io::copy(&mut client_read, &mut tunnel_write).await?;
        tunnel_write.shutdown().await?;
        Ok::<u64, io::Error>(n)
    };
    let downstream = async {
        let n = tokio::io::copy(&mut tunnel_read, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<u64, io::Error>(n)
    };
    tokio::pin!(upstream, downstream);

    tokio::select! {
        received = &mut downstream => Ok((0, received?)),
        sent = &mut upstream => {
            let sent = sent?;
            let received = downstream.await?;
            Ok((sent, received))
        }
    }
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &str,
) -> Result<(), DispatcherError> {
    let body = format!("{}\n", body);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rssh_gatekeeper::{AgentSlot, Gate};
    use rssh_router::{TransportError, Tunnel, TunnelTransport};
    use tokio::sync::Notify;
    use tokio::time::Instant;

    /// Tunnel whose exchanges echo every byte back
    #[derive(Debug)]
    struct EchoTransport {
        capacity: usize,
        notify: Notify,
    }

    impl EchoTransport {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
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
            let (near, far) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let (mut rd, mut wr) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
            Ok(Box::new(near))
        }

        async fn closed(&self) {
            self.notify.notified().await
        }

        fn is_closed(&self) -> bool {
            false
        }

        async fn close(&self) {}

        fn last_activity(&self) -> Instant {
            Instant::now()
        }
    }

    async fn start(registry: Arc<TunnelRegistry>) -> SocketAddr {
        start_with(registry, DispatcherConfig::new("127.0.0.1:0".parse().unwrap(), "example.com"))
            .await
    }

    async fn start_with(registry: Arc<TunnelRegistry>, config: DispatcherConfig) -> SocketAddr {
        let dispatcher = Dispatcher::new(config);
        let listener = dispatcher.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            dispatcher
                .serve(listener, registry, CancellationToken::new())
                .await
        });
        addr
    }

    fn registry_with_echo(subdomain: &str) -> Arc<TunnelRegistry> {
        registry_with_capacity(subdomain, 4)
    }

    fn registry_with_capacity(subdomain: &str, capacity: usize) -> Arc<TunnelRegistry> {
        let registry = Arc::new(TunnelRegistry::new());
        let slot = AgentSlot::new(Gate::new("127.0.0.1", 31240), "foo");
        let tunnel = Tunnel::new(slot, subdomain, Arc::new(EchoTransport::new(capacity)));
        registry.register(subdomain, Arc::new(tunnel)).unwrap();
        registry
    }

    async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    #[test]
    fn test_parse_head() {
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\nHost: foo"), None);
        assert_eq!(
            parse_head(b"GET /x HTTP/1.1\r\nhost: foo.example.com\r\n\r\nbody"),
            Some(Head::Complete {
                host: Some("foo.example.com".to_string()),
                request_line: "GET /x".to_string(),
                forward: b"GET /x HTTP/1.1\r\nhost: foo.example.com\r\nConnection: close\r\n\r\nbody"
                    .to_vec(),
            })
        );
        assert_eq!(
            parse_head(b"GET / HTTP/1.0\r\n\r\n"),
            Some(Head::Complete {
                host: None,
                request_line: "GET /".to_string(),
                forward: b"GET / HTTP/1.0\r\nConnection: close\r\n\r\n".to_vec(),
            })
        );
        assert!(matches!(
            parse_head(b"GET / HTTP/1.1\r\nHost: a.example.com\r\nHost: b.example.com\r\n\r\n"),
            Some(Head::Malformed(_))
        ));
        assert!(matches!(
            parse_head(b"\x00\x01garbage\r\n\r\n"),
            Some(Head::Malformed(_))
        ));
    }

    fn forwarded(request: &[u8]) -> Vec<u8> {
        match parse_head(request) {
            Some(Head::Complete { forward, .. }) => forward,
            other => panic!("unexpected head {:?}", other),
        }
    }

    #[test]
    fn test_keep_alive_rewritten_to_close() {
        let forward = forwarded(
            b"GET / HTTP/1.1\r\nHost: foo.example.com\r\nConnection: keep-alive\r\nKeep-Alive: timeout=5\r\nAccept: */*\r\n\r\n",
        );
        assert_eq!(
            forward,
            b"GET / HTTP/1.1\r\nHost: foo.example.com\r\nAccept: */*\r\nConnection: close\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_upgrade_forwarded_untouched() {
        let request = b"GET /ws HTTP/1.1\r\nHost: foo.example.com\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n";
        assert_eq!(forwarded(request), request.to_vec());
    }

    #[tokio::test]
    async fn test_echo_through_tunnel() {
        let addr = start(registry_with_echo("foo.example.com")).await;

        let request = b"POST /upload HTTP/1.1\r\nHost: foo.example.com:8080\r\nContent-Length: 5\r\n\r\nhello";
        let response = exchange(addr, request).await;

        assert_eq!(
            response,
            b"POST /upload HTTP/1.1\r\nHost: foo.example.com:8080\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"
                .to_vec()
        );
    }

    #[tokio::test]
    async fn test_busy_tunnel_is_service_unavailable() {
        let config = DispatcherConfig::new("127.0.0.1:0".parse().unwrap(), "example.com")
            .with_exchange_timeout(Duration::from_millis(200));
        let addr = start_with(registry_with_capacity("foo.example.com", 1), config).await;

        // Holds the only exchange: the request never ends
        let mut first = TcpStream::connect(addr).await.unwrap();
        first
            .write_all(b"POST / HTTP/1.1\r\nHost: foo.example.com\r\nContent-Length: 100\r\n\r\n")
            .await
            .unwrap();
        let mut echoed = [0u8; 16];
        first.read_exact(&mut echoed).await.unwrap();

        let response = exchange(addr, b"GET / HTTP/1.1\r\nHost: foo.example.com\r\n\r\n").await;
        assert!(
            response.starts_with(b"HTTP/1.1 503 Service Unavailable\r\n"),
            "{}",
            String::from_utf8_lossy(&response)
        );
    }

    #[tokio::test]
    async fn test_unknown_subdomain_is_bad_gateway() {
        let addr = start(registry_with_echo("foo.example.com")).await;

        let response = exchange(addr, b"GET / HTTP/1.1\r\nHost: bar.example.com\r\n\r\n").await;

        assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[tokio::test]
    async fn test_bad_hosts_are_bad_requests() {
        let addr = start(registry_with_echo("foo.example.com")).await;

        for request in [
            &b"GET / HTTP/1.1\r\nHost: foo.other.com\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nHost: a.foo.example.com\r\n\r\n"[..],
            &b"NOT HTTP AT ALL\r\n\r\n"[..],
        ] {
            let response = exchange(addr, request).await;
            assert!(
                response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"),
                "unexpected response to {:?}",
                String::from_utf8_lossy(request)
            );
        }
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let addr = start(registry_with_echo("foo.example.com")).await;

        // Exactly the limit, never terminated
        let mut request = b"GET / HTTP/1.1\r\nHost: foo.example.com\r\nX-Big: ".to_vec();
        request.resize(16 * 1024, b'y');

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(&request).await;
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = Dispatcher::new(DispatcherConfig::new(
            taken.local_addr().unwrap(),
            "example.com",
        ));

        assert!(matches!(
            dispatcher.bind().await,
            Err(DispatcherError::Bind { .. })
        ));
    }
}
