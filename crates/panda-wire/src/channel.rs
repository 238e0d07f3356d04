use std::{
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, FrameCodec, MAX_FRAME_BYTES};
use crate::error::{Result, WireError};

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncReadWrite>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens the underlying duplex stream for a [`ResilientChannel`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Connection timeout"))??;
        if let Err(err) = tune_stream(&stream) {
            tracing::debug!(target: "panda.wire", %endpoint, error = %err, "failed to tune socket");
        }
        Ok(Box::new(stream))
    }
}

/// Probe interval for idle connections, so a vanished peer is noticed.
const KEEPALIVE_TIME: Duration = Duration::from_secs(10);

fn tune_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything a channel reports, in the order it happened on the wire.
#[derive(Debug)]
pub enum ChannelEvent {
    Message {
        connection: ConnectionId,
        value: Value,
    },
    /// Sent exactly once per connection, after its last `Message`.
    Closed {
        connection: ConnectionId,
        error: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub read_buffer_size: usize,
    pub max_frame_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8 * 1024,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

struct LiveConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
}

struct Inner {
    connector: Arc<dyn Connector>,
    current: Mutex<Option<LiveConnection>>,
    /// Bumped by every `connect`; an attempt that is no longer the latest is discarded.
    attempt: AtomicU64,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<ChannelEvent>,
    config: ChannelConfig,
}

/// Owns at most one live duplex connection.
#[derive(Clone)]
pub struct ResilientChannel {
    inner: Arc<Inner>,
}

impl ResilientChannel {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            connector,
            current: Mutex::new(None),
            attempt: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            events,
            config,
        });
        (Self { inner }, events_rx)
    }

    pub fn tcp(connect_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        Self::new(
            Arc::new(TcpConnector { connect_timeout }),
            ChannelConfig::default(),
        )
    }

    /// Connect to `endpoint`, replacing any live connection.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<ConnectionId> {
        let attempt = self.inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.close();

        tracing::debug!(target: "panda.wire", %endpoint, attempt, "connecting");
        let stream = self.inner.connector.connect(endpoint).await?;

        if self.inner.attempt.load(Ordering::SeqCst) != attempt {
            tracing::debug!(target: "panda.wire", %endpoint, attempt, "discarding superseded connection");
            return Err(WireError::Cancelled);
        }
        Ok(self.attach(stream))
    }

    /// Adopt an already established stream as the live connection.
    pub fn attach<S>(&self, stream: S) -> ConnectionId
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let previous = self.inner.current.lock().replace(LiveConnection {
            id,
            outbound,
            shutdown: shutdown.clone(),
        });
        if let Some(previous) = previous {
            previous.shutdown.cancel();
        }

        tokio::spawn(write_loop(writer, outbound_rx, shutdown.clone()));
        tokio::spawn(read_loop(reader, self.inner.clone(), id, shutdown));
        id
    }

    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let frame = codec::encode(message)?;
        self.send_frame(frame)
    }

    pub fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let current = self.inner.current.lock();
        let Some(conn) = current.as_ref() else {
            return Err(WireError::NotConnected);
        };
        conn.outbound
            .send(frame)
            .map_err(|_| WireError::NotConnected)
    }

    /// Release the live connection, if any. Idempotent.
    pub fn close(&self) {
        let conn = self.inner.current.lock().take();
        if let Some(conn) = conn {
            tracing::debug!(target: "panda.wire", connection = %conn.id, "closing connection");
            conn.shutdown.cancel();
        }
    }

    /// Like [`ResilientChannel::close`], but only if `id` is still the live connection.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        let conn = {
            let mut current = self.inner.current.lock();
            if current.as_ref().is_some_and(|conn| conn.id == id) {
                current.take()
            } else {
                None
            }
        };
        match conn {
            Some(conn) => {
                conn.shutdown.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current.lock().is_some()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.current.lock().as_ref().map(|conn| conn.id)
    }
}

async fn read_loop<R>(mut reader: R, inner: Arc<Inner>, id: ConnectionId, shutdown: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::with_max_frame_bytes(inner.config.max_frame_bytes);
    let mut buf = vec![0u8; inner.config.read_buffer_size.max(1)];

    let error = loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break None,
            res = reader.read(&mut buf) => res,
        };
        match read {
            Ok(0) => break None,
            Ok(n) => {
                for value in codec.feed(&buf[..n]) {
                    let _ = inner.events.send(ChannelEvent::Message {
                        connection: id,
                        value,
                    });
                }
            }
            Err(err) => break Some(err.to_string()),
        }
    };

    shutdown.cancel();
    {
        let mut current = inner.current.lock();
        if current.as_ref().is_some_and(|conn| conn.id == id) {
            *current = None;
        }
    }

    tracing::debug!(target: "panda.wire", connection = %id, error = ?error, "connection closed");
    let _ = inner.events.send(ChannelEvent::Closed {
        connection: id,
        error,
    });
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            _ = shutdown.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(err) = write_frame(&mut writer, &frame).await {
            tracing::debug!(target: "panda.wire", error = %err, "write failed");
            shutdown.cancel();
            return;
        }
    }

    // Frames queued before the close still go out, e.g. a final `disconnect`.
    while let Ok(frame) = outbound.try_recv() {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
