//! Relays the editor's LSP stream (stdio) to the remote language service.
//!
//! The editor performs the `initialize` handshake once per session, but the
//! remote service forgets it whenever the connection drops. After a reconnect
//! the relay replays the editor's `initialize`/`initialized` pair and swallows
//! the duplicate `initialize` response. Editor messages that arrive while the
//! service is unreachable are queued and flushed in order on reconnect.

use std::{collections::VecDeque, io, sync::Arc};

use panda_config::LanguageServerConfig;
use panda_wire::{codec, ConnectionId, FrameCodec};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::connector::{ServiceClient, ServiceConnector, ServiceLink};

pub const MAX_QUEUED_MESSAGES: usize = 1024;

#[derive(Debug, Default)]
struct RelayState {
    initialize: Option<Value>,
    initialized: Option<Value>,
    /// The editor's `initialize` reached a service at least once.
    handshake_delivered: bool,
    /// The editor has seen the response to its own `initialize`.
    initialize_answered: bool,
    /// Id of a replayed `initialize` whose response the editor must not see.
    swallow_response: Option<Value>,
    queued: VecDeque<Value>,
}

pub struct Relay {
    editor: mpsc::UnboundedSender<Value>,
    state: Mutex<RelayState>,
    max_queued: usize,
}

impl Relay {
    pub fn new(editor: mpsc::UnboundedSender<Value>) -> Self {
        Self::with_queue_limit(editor, MAX_QUEUED_MESSAGES)
    }

    pub fn with_queue_limit(editor: mpsc::UnboundedSender<Value>, max_queued: usize) -> Self {
        Self {
            editor,
            state: Mutex::new(RelayState::default()),
            max_queued: max_queued.max(1),
        }
    }

    /// Forward one editor message to the service, or queue it while disconnected.
    pub fn forward(&self, link: &ServiceLink, message: Value) {
        let mut state = self.state.lock();
        match method(&message) {
            Some("initialize") if message.get("id").is_some() => {
                state.initialize = Some(message.clone());
                state.initialize_answered = false;
            }
            Some("initialized") => state.initialized = Some(message.clone()),
            _ => {}
        }

        // Anything already queued must go first.
        if state.queued.is_empty() {
            match link.send(&message) {
                Ok(()) => {
                    if is_initialize(&message) {
                        state.handshake_delivered = true;
                    }
                    return;
                }
                Err(err) => {
                    tracing::debug!(target: "panda.lsp", error = %err, "language service unavailable, queueing");
                }
            }
        }

        if state.queued.len() >= self.max_queued {
            state.queued.pop_front();
            tracing::warn!(
                target: "panda.lsp",
                limit = self.max_queued,
                "editor message queue full, dropping oldest message"
            );
        }
        state.queued.push_back(message);
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }
}

impl ServiceClient for Relay {
    fn on_connected(&self, connection: ConnectionId, link: &ServiceLink) {
        let mut state = self.state.lock();

        if state.handshake_delivered {
            if let Some(initialize) = state.initialize.clone() {
                tracing::info!(target: "panda.lsp", %connection, "replaying initialize handshake");
                if state.initialize_answered {
                    state.swallow_response = initialize.get("id").cloned();
                }
                let _ = link.send(&initialize);
            }
            if let Some(initialized) = state.initialized.clone() {
                let _ = link.send(&initialized);
            }
        }

        let queued = state.queued.len();
        while let Some(message) = state.queued.pop_front() {
            if let Err(err) = link.send(&message) {
                tracing::debug!(target: "panda.lsp", error = %err, "connection lost while flushing queue");
                state.queued.push_front(message);
                break;
            }
            if is_initialize(&message) {
                state.handshake_delivered = true;
            }
        }
        if queued > 0 {
            tracing::debug!(target: "panda.lsp", %connection, flushed = queued - state.queued.len(), "flushed queued editor messages");
        }
    }

    fn on_message(&self, value: Value) {
        {
            let mut state = self.state.lock();
            if is_response(&value) {
                let id = value.get("id");
                if state.swallow_response.is_some() && state.swallow_response.as_ref() == id {
                    state.swallow_response = None;
                    tracing::debug!(target: "panda.lsp", "swallowed response to replayed initialize");
                    return;
                }
                if state
                    .initialize
                    .as_ref()
                    .is_some_and(|initialize| initialize.get("id") == id)
                {
                    state.initialize_answered = true;
                }
            }
        }
        let _ = self.editor.send(value);
    }

    fn on_disconnected(&self, connection: ConnectionId, error: Option<&str>) {
        tracing::info!(target: "panda.lsp", %connection, error = ?error, "language service disconnected");
    }
}

fn method(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

fn is_initialize(message: &Value) -> bool {
    method(message) == Some("initialize") && message.get("id").is_some()
}

fn is_response(message: &Value) -> bool {
    message.get("id").is_some() && message.get("method").is_none()
}

/// Relay the editor's stdio to the language service.
pub async fn run_stdio(config: LanguageServerConfig) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run(stdin, stdout, config).await.map_err(anyhow::Error::from)
}

/// Relay until the editor closes its stream.
pub async fn run<R, W>(mut reader: R, writer: W, config: LanguageServerConfig) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (editor_tx, editor_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, editor_rx));

    let relay = Arc::new(Relay::new(editor_tx));
    let connector = ServiceConnector::new(&config, relay.clone());
    let link = connector.link();
    connector.start();

    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; 8 * 1024];
    let result = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(err) => break Err(err),
        };
        for message in codec.feed(&buf[..n]) {
            relay.forward(&link, message);
        }
    };

    connector.stop();
    drop(connector);
    drop(link);
    drop(relay);
    let _ = writer_task.await;
    result
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(target: "panda.lsp", error = %err, "failed to encode editor message");
                continue;
            }
        };
        if writer.write_all(&frame).await.is_err() {
            tracing::debug!(target: "panda.lsp", "editor stream closed");
            return;
        }
        let _ = writer.flush().await;
    }
}
