use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, Notify},
};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, FrameCodec};
use crate::message::{EventMessage, Message, RequestMessage, ResponseMessage};

/// A tiny remote debug server used for unit/integration testing.
///
/// It speaks the framed request/response/event envelope, records everything it
/// receives, and answers each request with a scripted body (`{}` unless told
/// otherwise). It knows nothing about debugging semantics.
pub struct MockDebugServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug, Default)]
pub struct MockDebugServerConfig {
    /// Response bodies keyed by command name.
    pub responses: HashMap<String, Value>,
    /// Commands that are recorded but never answered.
    pub silent_commands: HashSet<String>,
    /// Commands answered with `success: false`.
    pub failing_commands: HashSet<String>,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
}

struct State {
    config: Mutex<MockDebugServerConfig>,
    received: Mutex<Vec<Value>>,
    connections: Mutex<Vec<Connection>>,
    accepted: AtomicUsize,
    changed: Notify,
}

impl MockDebugServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockDebugServerConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockDebugServerConfig) -> std::io::Result<Self> {
        Self::spawn_on(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), config).await
    }

    /// Bind to a specific address, e.g. to come back up on a port clients are
    /// already retrying against.
    pub async fn spawn_on(addr: SocketAddr, config: MockDebugServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State {
            config: Mutex::new(config),
            received: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            changed: Notify::new(),
        });

        tokio::spawn(run(listener, state.clone(), shutdown.clone()));

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn respond_with(&self, command: &str, body: Value) {
        self.state
            .config
            .lock()
            .responses
            .insert(command.to_string(), body);
    }

    pub fn never_respond(&self, command: &str) {
        self.state
            .config
            .lock()
            .silent_commands
            .insert(command.to_string());
    }

    pub fn fail(&self, command: &str) {
        self.state
            .config
            .lock()
            .failing_commands
            .insert(command.to_string());
    }

    /// Every decoded frame received so far, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    pub fn requests(&self) -> Vec<RequestMessage> {
        self.received()
            .into_iter()
            .filter_map(|value| match Message::from_value(value) {
                Ok(Message::Request(request)) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.command)
            .collect()
    }

    /// Number of connections accepted over the server's lifetime.
    pub fn connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Push an event to every live connection.
    pub fn send_event(&self, event: &str, body: Option<Value>) {
        self.send_raw(&Message::Event(EventMessage::new(event, body)));
    }

    /// Push an arbitrary JSON body to every live connection.
    pub fn send_raw<T: serde::Serialize + ?Sized>(&self, message: &T) {
        let Ok(frame) = codec::encode(message) else {
            return;
        };
        for conn in self.state.connections.lock().iter() {
            let _ = conn.outbound.send(frame.clone());
        }
    }

    /// Close every live connection from the server side.
    pub fn drop_connections(&self) {
        for conn in self.state.connections.lock().drain(..) {
            conn.shutdown.cancel();
        }
    }

    /// Wait until a request for `command` has been received.
    pub async fn wait_for_command(&self, command: &str, timeout: Duration) -> Option<RequestMessage> {
        self.wait_until(timeout, || {
            self.requests()
                .into_iter()
                .find(|request| request.command == command)
        })
        .await
    }

    /// Wait until at least `count` connections have been accepted.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || (self.connections() >= count).then_some(()))
            .await
            .is_some()
    }

    async fn wait_until<T>(&self, timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.state.changed.notified();
                if let Some(found) = check() {
                    return found;
                }
                changed.await;
            }
        })
        .await
        .ok()
    }
}

impl Drop for MockDebugServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(listener: TcpListener, state: Arc<State>, shutdown: CancellationToken) {
    loop {
        let accept = tokio::select! {
            _ = shutdown.cancelled() => return,
            accept = listener.accept() => accept,
        };
        let Ok((socket, _)) = accept else {
            return;
        };

        let conn_shutdown = shutdown.child_token();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        state.connections.lock().push(Connection {
            outbound: outbound.clone(),
            shutdown: conn_shutdown.clone(),
        });
        state.accepted.fetch_add(1, Ordering::SeqCst);
        state.changed.notify_waiters();

        tokio::spawn(serve(socket, state.clone(), outbound, outbound_rx, conn_shutdown));
    }
}

async fn serve(
    socket: TcpStream,
    state: Arc<State>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = socket.into_split();

    let writer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                frame = outbound_rx.recv() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut codec = FrameCodec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let values: Vec<Value> = codec.feed(&buf[..n]).collect();
        for value in values {
            state.received.lock().push(value.clone());
            if let Ok(Message::Request(request)) = Message::from_value(value) {
                if let Some(frame) = reply_for(&state, &request) {
                    let _ = outbound.send(frame);
                }
            }
            state.changed.notify_waiters();
        }
    }
    shutdown.cancel();
}

fn reply_for(state: &State, request: &RequestMessage) -> Option<Vec<u8>> {
    let config = state.config.lock();
    if config.silent_commands.contains(&request.command) {
        return None;
    }
    let success = !config.failing_commands.contains(&request.command);
    let body = config
        .responses
        .get(&request.command)
        .cloned()
        .unwrap_or_else(|| json!({}));
    let response = Message::Response(ResponseMessage {
        seq: 0,
        request_seq: request.seq,
        success,
        command: Some(request.command.clone()),
        message: (!success).then(|| format!("{} failed", request.command)),
        error: None,
        body: Some(body),
    });
    codec::encode(&response).ok()
}
