use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::channel::ResilientChannel;
use crate::codec;
use crate::error::{Result, WireError};
use crate::message::{EventMessage, Message, RequestMessage, ResponseMessage};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type EventHandler = Arc<dyn Fn(&EventMessage) + Send + Sync>;
type ReplySlot = oneshot::Sender<Result<Value>>;

/// A request that has been written to the channel and is awaiting its response.
#[derive(Debug)]
#[must_use = "a pending reply must be awaited with `MessageRouter::wait`"]
pub struct PendingReply {
    seq: u64,
    command: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Correlates requests with responses and fans events out to handlers.
///
/// Each pending request owns exactly one reply slot. The slot is removed from
/// the table by whichever of "matching response" or "timeout" gets to it first;
/// the loser finds nothing and does nothing.
pub struct MessageRouter {
    channel: ResilientChannel,
    pending: Mutex<HashMap<u64, ReplySlot>>,
    next_seq: AtomicU64,
    handlers: Mutex<Vec<EventHandler>>,
    request_timeout: Duration,
}

impl MessageRouter {
    pub fn new(channel: ResilientChannel, request_timeout: Duration) -> Self {
        Self {
            channel,
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
            request_timeout,
        }
    }

    pub fn channel(&self) -> &ResilientChannel {
        &self.channel
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send `command` and wait for its response body.
    pub async fn send(&self, command: &str, arguments: Value) -> Result<Value> {
        let reply = self.dispatch(command, arguments)?;
        self.wait(reply).await
    }

    /// Write a request without waiting for its response.
    ///
    /// Fails with [`WireError::NotConnected`] before a sequence number is
    /// allocated when there is no live connection.
    pub fn dispatch(&self, command: &str, arguments: Value) -> Result<PendingReply> {
        if !self.channel.is_connected() {
            return Err(WireError::NotConnected);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let frame = codec::encode(&Message::Request(RequestMessage {
            seq,
            command: command.to_string(),
            arguments,
        }))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);
        if let Err(err) = self.channel.send_frame(frame) {
            self.pending.lock().remove(&seq);
            return Err(err);
        }

        tracing::trace!(target: "panda.wire", seq, command, "request sent");
        Ok(PendingReply {
            seq,
            command: command.to_string(),
            rx,
        })
    }

    /// Wait for `reply`, racing its response against the request timeout.
    pub async fn wait(&self, reply: PendingReply) -> Result<Value> {
        let PendingReply {
            seq,
            command,
            mut rx,
        } = reply;

        match tokio::time::timeout(self.request_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WireError::ConnectionClosed),
            Err(_elapsed) => {
                if self.pending.lock().remove(&seq).is_some() {
                    tracing::warn!(
                        target: "panda.wire",
                        seq,
                        command = %command,
                        timeout = ?self.request_timeout,
                        "request timed out"
                    );
                    return Err(WireError::Timeout(self.request_timeout));
                }
                // The response claimed the slot just before the timer fired.
                rx.await.unwrap_or(Err(WireError::ConnectionClosed))
            }
        }
    }

    /// Handle one decoded message from the remote side.
    pub fn on_message(&self, value: Value) {
        match Message::from_value(value) {
            Ok(Message::Response(response)) => self.resolve(response),
            Ok(Message::Event(event)) => self.dispatch_event(&event),
            Ok(Message::Request(request)) => {
                tracing::debug!(
                    target: "panda.wire",
                    seq = request.seq,
                    command = %request.command,
                    "ignoring request from remote"
                );
            }
            Err(err) => {
                tracing::debug!(target: "panda.wire", error = %err, "dropping unrecognized message");
            }
        }
    }

    fn resolve(&self, response: ResponseMessage) {
        let slot = self.pending.lock().remove(&response.request_seq);
        let Some(slot) = slot else {
            tracing::debug!(
                target: "panda.wire",
                request_seq = response.request_seq,
                "response for unknown or expired request"
            );
            return;
        };

        if !response.success {
            tracing::warn!(
                target: "panda.wire",
                request_seq = response.request_seq,
                command = ?response.command,
                message = ?response.message,
                error = ?response.error,
                "remote reported failure"
            );
        }
        let body = response.body.unwrap_or_else(|| json!({}));
        let _ = slot.send(Ok(body));
    }

    fn dispatch_event(&self, event: &EventMessage) {
        // Clone the list so handlers can register further handlers.
        let handlers = self.handlers.lock().clone();
        tracing::trace!(target: "panda.wire", event = %event.event, handlers = handlers.len(), "event");
        for handler in handlers {
            handler(event);
        }
    }

    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.handlers.lock().push(Arc::new(handler));
    }

    /// Receive every event through an ordered stream instead of a callback.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<EventMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_event_handler(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Fail every outstanding request, e.g. after the connection closed.
    pub fn fail_pending(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.send(Err(WireError::ConnectionClosed));
        }
        if count > 0 {
            tracing::debug!(target: "panda.wire", count, "failed pending requests");
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}
