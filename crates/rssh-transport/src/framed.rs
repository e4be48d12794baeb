//! Exchanges multiplexed on one message-framed connection

use crate::codec_error;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use rssh_proto::{ExchangeId, TunnelCodec, TunnelMessage};
use rssh_router::{Exchange, TransportError, TunnelTransport};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub type MessageFramed<S> = Framed<S, TunnelCodec>;

type MessageSink = Pin<Box<dyn Sink<TunnelMessage, Error = rssh_proto::CodecError> + Send>>;

/// Largest payload of one `ExchangeData` frame
const CHUNK_SIZE: usize = 32 * 1024;
/// Frames buffered per exchange before the reader applies backpressure
const EXCHANGE_BUFFER: usize = 64;
/// Buffer of the in-process pipe handed out as an exchange
const PIPE_SIZE: usize = 64 * 1024;
/// Exchanges in flight on one tunnel unless configured otherwise; the agent
/// serves each exchange on its own task
pub const DEFAULT_MAX_EXCHANGES: usize = 64;

/// Last-traffic clock shared by the reader and exchange pumps
#[derive(Debug)]
struct Activity {
    origin: Instant,
    elapsed_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.elapsed_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed))
    }
}

struct Shared {
    writer: Mutex<MessageSink>,
    routes: DashMap<ExchangeId, mpsc::Sender<TunnelMessage>>,
    activity: Activity,
    closed: CancellationToken,
}

impl Shared {
    async fn send(&self, message: TunnelMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(message).await.map_err(codec_error)?;
        self.activity.touch();
        Ok(())
    }
}

/// Tunnel transport carried by one message-framed connection
///
/// A background task owns the read half: it answers pings and routes
/// exchange frames to the pump of their exchange. The connection counts as
/// closed once the agent hangs up or [`TunnelTransport::close`] is called.
pub struct FramedTunnel {
    shared: Arc<Shared>,
    next_exchange_id: AtomicU32,
    max_exchanges: usize,
    reader: JoinHandle<()>,
}

impl FramedTunnel {
    pub fn new<S>(framed: MessageFramed<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = framed.split();
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::pin(sink)),
            routes: DashMap::new(),
            activity: Activity::new(),
            closed: CancellationToken::new(),
        });

        let reader = tokio::spawn(read_loop(stream, shared.clone()));

        Self {
            shared,
            next_exchange_id: AtomicU32::new(1),
            max_exchanges: DEFAULT_MAX_EXCHANGES,
            reader,
        }
    }

    /// Declare how many exchanges the agent serves at once
    pub fn with_max_exchanges(mut self, max_exchanges: usize) -> Self {
        self.max_exchanges = max_exchanges.max(1);
        self
    }

    /// Number of exchanges currently in flight
    pub fn active_exchanges(&self) -> usize {
        self.shared.routes.len()
    }
}

impl fmt::Debug for FramedTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedTunnel")
            .field("max_exchanges", &self.max_exchanges)
            .field("active_exchanges", &self.active_exchanges())
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl Drop for FramedTunnel {
    fn drop(&mut self) {
        self.shared.closed.cancel();
        self.reader.abort();
    }
}

#[async_trait]
impl TunnelTransport for FramedTunnel {
    fn max_concurrent_exchanges(&self) -> usize {
        self.max_exchanges
    }

    async fn open_exchange(&self) -> Result<Exchange, TransportError> {
        let exchange_id = self.next_exchange_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(EXCHANGE_BUFFER);
        self.shared.routes.insert(exchange_id, tx);

        if let Err(e) = self.shared.send(TunnelMessage::ExchangeOpen { exchange_id }).await {
            self.shared.routes.remove(&exchange_id);
            return Err(e);
        }

        trace!("Opened exchange {}", exchange_id);

        let (local, remote) = tokio::io::duplex(PIPE_SIZE);
        let request_ended = Arc::new(AtomicBool::new(false));
        tokio::spawn(pump_exchange(
            exchange_id,
            remote,
            request_ended.clone(),
            rx,
            self.shared.clone(),
        ));

        Ok(Box::new(ExchangePipe {
            pipe: local,
            request_ended,
        }))
    }

    async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    async fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        self.shared.closed.cancel();

        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("Error shutting down tunnel connection: {}", e);
        }
    }

    fn last_activity(&self) -> Instant {
        self.shared.activity.last()
    }
}

/// Server end of one exchange
///
/// Shutting down the write half ends the request. Dropping the pipe without
/// doing so aborts the exchange.
struct ExchangePipe {
    pipe: DuplexStream,
    request_ended: Arc<AtomicBool>,
}

impl AsyncRead for ExchangePipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_read(cx, buf)
    }
}

impl AsyncWrite for ExchangePipe {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.pipe).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Set before the pump can observe end of stream
        self.request_ended.store(true, Ordering::SeqCst);
        Pin::new(&mut self.pipe).poll_shutdown(cx)
    }
}

async fn read_loop<S>(mut stream: SplitStream<MessageFramed<S>>, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            frame = stream.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!("Dropping tunnel after read error: {}", e);
                break;
            }
            None => {
                debug!("Agent closed the tunnel connection");
                break;
            }
        };

        shared.activity.touch();

        match message {
            TunnelMessage::Ping { timestamp } => {
                if let Err(e) = shared.send(TunnelMessage::Pong { timestamp }).await {
                    debug!("Failed to answer ping: {}", e);
                }
            }
            TunnelMessage::Pong { .. } => {}
            message => match message.exchange_id() {
                Some(exchange_id) => {
                    let route = shared.routes.get(&exchange_id).map(|r| r.value().clone());
                    match route {
                        Some(route) => {
                            // Exchange already gone when the send fails
                            let _ = route.send(message).await;
                        }
                        None => trace!("Frame for finished exchange {} dropped", exchange_id),
                    }
                }
                None => warn!("Unexpected message on tunnel: {:?}", message),
            },
        }
    }

    shared.closed.cancel();
    shared.routes.clear();
}

/// Move bytes between one exchange's pipe and its frames
async fn pump_exchange(
    exchange_id: ExchangeId,
    pipe: DuplexStream,
    request_ended: Arc<AtomicBool>,
    mut inbound: mpsc::Receiver<TunnelMessage>,
    shared: Arc<Shared>,
) {
    let (mut pipe_rd, mut pipe_wr) = tokio::io::split(pipe);

    let upstream = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = pipe_rd.read(&mut buf).await?;
            if n == 0 {
                if !request_ended.load(Ordering::SeqCst) {
                    return Err(TransportError::Protocol(format!(
                        "exchange {} dropped before the request ended",
                        exchange_id
                    )));
                }
                shared.send(TunnelMessage::ExchangeEnd { exchange_id }).await?;
                return Ok::<(), TransportError>(());
            }
            shared
                .send(TunnelMessage::ExchangeData {
                    exchange_id,
                    data: buf[..n].to_vec(),
                })
                .await?;
        }
    };

    let downstream = async {
        while let Some(message) = inbound.recv().await {
            match message {
                TunnelMessage::ExchangeData { data, .. } => pipe_wr.write_all(&data).await?,
                TunnelMessage::ExchangeEnd { .. } => {
                    pipe_wr.shutdown().await?;
                    return Ok::<(), TransportError>(());
                }
                TunnelMessage::ExchangeAbort { .. } => {
                    return Err(TransportError::Protocol(format!(
                        "exchange {} aborted by agent",
                        exchange_id
                    )));
                }
                other => trace!("Ignoring {:?} on exchange {}", other, exchange_id),
            }
        }
        Err(TransportError::Closed)
    };

    tokio::pin!(upstream);
    tokio::pin!(downstream);

    let mut upstream_done = false;
    let outcome = loop {
        tokio::select! {
            result = &mut upstream, if !upstream_done => match result {
                Ok(()) => upstream_done = true,
                Err(e) => break Err(e),
            },
            result = &mut downstream => break result,
        }
    };

    shared.routes.remove(&exchange_id);

    match outcome {
        Ok(()) if upstream_done => trace!("Exchange {} complete", exchange_id),
        Ok(()) => {
            // Response finished before the request; tell the agent to stop reading
            let _ = shared.send(TunnelMessage::ExchangeAbort { exchange_id }).await;
            trace!("Exchange {} complete before request end", exchange_id);
        }
        Err(e) => {
            debug!("Exchange {} failed: {}", exchange_id, e);
            let _ = shared.send(TunnelMessage::ExchangeAbort { exchange_id }).await;
        }
    }
}
