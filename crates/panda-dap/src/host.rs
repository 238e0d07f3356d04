//! Messages flowing from the bridge to the editor.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::types::THREAD_ID;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Initialized,
    Stopped { reason: String, thread_id: i64 },
    Output { output: String, category: String },
    Terminated,
}

impl HostEvent {
    pub fn stopped_at_entry() -> Self {
        HostEvent::Stopped {
            reason: "entry".to_string(),
            thread_id: THREAD_ID,
        }
    }

    pub fn console(output: impl Into<String>) -> Self {
        HostEvent::Output {
            output: output.into(),
            category: "console".to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::Initialized => "initialized",
            HostEvent::Stopped { .. } => "stopped",
            HostEvent::Output { .. } => "output",
            HostEvent::Terminated => "terminated",
        }
    }

    pub fn body(&self) -> Option<Value> {
        match self {
            HostEvent::Initialized | HostEvent::Terminated => None,
            HostEvent::Stopped { reason, thread_id } => Some(json!({
                "reason": reason,
                "threadId": thread_id,
            })),
            HostEvent::Output { output, category } => Some(json!({
                "output": output,
                "category": category,
            })),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    Response {
        request_seq: u64,
        command: String,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    },
    Event(HostEvent),
}

/// Ordered outbox to the editor.
///
/// Responses and events share one queue so the editor sees them in the order
/// the bridge produced them. `terminated` is sent at most once per connection.
#[derive(Debug, Clone)]
pub struct HostNotifier {
    tx: mpsc::UnboundedSender<HostMessage>,
    terminated: Arc<AtomicBool>,
}

impl HostNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HostMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                terminated: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn emit(&self, event: HostEvent) {
        if event == HostEvent::Terminated && self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(HostMessage::Event(event));
    }

    pub fn respond(
        &self,
        request_seq: u64,
        command: &str,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) {
        let _ = self.tx.send(HostMessage::Response {
            request_seq,
            command: command.to_string(),
            success,
            message,
            body,
        });
    }

    /// Allow a new `terminated` after a fresh connection is established.
    pub(crate) fn rearm_terminated(&self) {
        self.terminated.store(false, Ordering::SeqCst);
    }
}
