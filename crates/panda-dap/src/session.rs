//! The debug bridge: editor requests in, remote commands out, remote events back.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use panda_config::DebugConfig;
use panda_wire::{
    ChannelConfig, ChannelEvent, ConnectionId, ConnectionState, Connector, Endpoint, EventMessage,
    MessageRouter, ReconnectPolicy, ResilientChannel, TcpConnector, WireError,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::host::{HostEvent, HostNotifier};
use crate::types::{
    list_field, AttachArguments, Breakpoint, Capabilities, EvaluateArguments, LaunchArguments,
    RemoteLaunch, Scope, ScopesArguments, SetBreakpointsArguments, SourceBreakpoint, StackFrame,
    Thread, ThreadArguments, Variable, VariablesArguments, THREAD_ID,
};

/// The outcome of one editor request: the response body plus events that must
/// follow the response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub body: Option<Value>,
    pub events: Vec<HostEvent>,
}

impl Reply {
    fn empty() -> Self {
        Self::default()
    }

    fn with_body(body: Value) -> Self {
        Self {
            body: Some(body),
            events: Vec::new(),
        }
    }

    fn followed_by(mut self, event: HostEvent) -> Self {
        self.events.push(event);
        self
    }
}

#[derive(Debug, Default)]
struct SessionState {
    /// Breakpoint sets submitted while disconnected, last write wins per path.
    pending_breakpoints: BTreeMap<String, Vec<SourceBreakpoint>>,
    /// What the editor was last told for each path.
    reported_breakpoints: HashMap<String, Vec<Breakpoint>>,
    configuration_done: bool,
    connection: Option<ConnectionId>,
}

/// One debugging session between the editor and a remote debug server.
///
/// Must be created inside a tokio runtime; it spawns the task that pumps remote
/// frames into the router.
pub struct BridgeSession {
    router: Arc<MessageRouter>,
    policy: Arc<ReconnectPolicy>,
    notifier: HostNotifier,
    state: Arc<Mutex<SessionState>>,
    config: DebugConfig,
    shutdown: CancellationToken,
}

impl BridgeSession {
    pub fn new(config: DebugConfig, notifier: HostNotifier) -> Self {
        let connector = Arc::new(TcpConnector {
            connect_timeout: config.connect_timeout(),
        });
        Self::with_connector(connector, config, notifier)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        config: DebugConfig,
        notifier: HostNotifier,
    ) -> Self {
        let (channel, events) = ResilientChannel::new(connector, ChannelConfig::default());
        let router = Arc::new(MessageRouter::new(channel, config.request_timeout()));
        let policy = Arc::new(ReconnectPolicy::single_attempt());
        let state = Arc::new(Mutex::new(SessionState::default()));
        let shutdown = CancellationToken::new();

        let handler_notifier = notifier.clone();
        router.add_event_handler(move |event| {
            if let Some(host_event) = translate_event(event) {
                handler_notifier.emit(host_event);
            }
        });

        tokio::spawn(pump(
            events,
            router.clone(),
            policy.clone(),
            state.clone(),
            notifier.clone(),
            shutdown.clone(),
        ));

        Self {
            router,
            policy,
            notifier,
            state,
            config,
            shutdown,
        }
    }

    /// Handle one editor request by name.
    pub async fn handle(&self, command: &str, arguments: Value) -> Result<Reply> {
        match command {
            "initialize" => Ok(self.initialize()),
            "launch" => self.launch(parse_args(command, arguments)?).await,
            "attach" => self.attach(parse_args(command, arguments)?).await,
            "configurationDone" => Ok(self.configuration_done()),
            "setBreakpoints" => self.set_breakpoints(parse_args(command, arguments)?).await,
            "threads" => Ok(Reply::with_body(json!({ "threads": [Thread::main()] }))),
            "stackTrace" => self.stack_trace(parse_args(command, arguments)?).await,
            "scopes" => self.scopes(parse_args(command, arguments)?).await,
            "variables" => self.variables(parse_args(command, arguments)?).await,
            "evaluate" => Ok(self.evaluate(parse_args(command, arguments)?).await),
            "continue" => {
                let args: ThreadArguments = parse_args(command, arguments)?;
                self.fire(command, thread_payload(&args));
                Ok(Reply::with_body(json!({ "allThreadsContinued": true })))
            }
            "next" | "stepIn" | "stepOut" | "pause" => {
                let args: ThreadArguments = parse_args(command, arguments)?;
                self.fire(command, thread_payload(&args));
                Ok(Reply::empty())
            }
            "disconnect" => Ok(self.disconnect()),
            "terminate" => Ok(self.terminate()),
            other => Err(BridgeError::Unsupported(other.to_string())),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.router.channel().is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.policy.state()
    }

    pub fn configuration_done_received(&self) -> bool {
        self.state.lock().configuration_done
    }

    pub fn pending_breakpoints(&self) -> BTreeMap<String, Vec<SourceBreakpoint>> {
        self.state.lock().pending_breakpoints.clone()
    }

    pub fn reported_breakpoints(&self, path: &str) -> Option<Vec<Breakpoint>> {
        self.state.lock().reported_breakpoints.get(path).cloned()
    }

    fn initialize(&self) -> Reply {
        self.log("Debug adapter initialized");
        Reply::with_body(json!(Capabilities::default())).followed_by(HostEvent::Initialized)
    }

    async fn launch(&self, args: LaunchArguments) -> Result<Reply> {
        let endpoint = Endpoint::new(
            self.config.host.clone(),
            args.debug_server.unwrap_or(self.config.port),
        );
        if let Err(err) = self.launch_sequence(&endpoint, &args).await {
            tracing::warn!(target: "panda.dap", %endpoint, error = %err, "launch failed");
            return Err(BridgeError::Launch(err));
        }

        let reply = Reply::empty();
        Ok(if args.stop_on_entry {
            reply.followed_by(HostEvent::stopped_at_entry())
        } else {
            reply
        })
    }

    async fn launch_sequence(
        &self,
        endpoint: &Endpoint,
        args: &LaunchArguments,
    ) -> std::result::Result<(), WireError> {
        self.connect(endpoint).await?;
        self.log("Connected to server");

        self.router.send("initialize", json!({})).await?;
        self.log("Sent initialize");

        self.flush_pending_breakpoints().await?;

        let configuration_done = self.state.lock().configuration_done;
        if configuration_done {
            self.log("Sending configurationDone");
            self.router.send("configurationDone", json!({})).await?;
        }

        self.router
            .send(
                "launch",
                json!(RemoteLaunch {
                    program: &args.program,
                    stop_on_entry: args.stop_on_entry,
                    cwd: args.cwd.as_deref(),
                }),
            )
            .await?;
        self.log("Sent launch");
        Ok(())
    }

    async fn attach(&self, args: AttachArguments) -> Result<Reply> {
        let endpoint = Endpoint::new(
            args.host.unwrap_or_else(|| self.config.host.clone()),
            args.port.unwrap_or(self.config.port),
        );
        let attached = async {
            self.connect(&endpoint).await?;
            self.log("Connected to server");
            self.flush_pending_breakpoints().await
        };
        if let Err(err) = attached.await {
            tracing::warn!(target: "panda.dap", %endpoint, error = %err, "attach failed");
            return Err(BridgeError::Attach(err));
        }
        Ok(Reply::empty())
    }

    async fn connect(&self, endpoint: &Endpoint) -> std::result::Result<(), WireError> {
        // A replaced connection must not end the session.
        self.state.lock().connection = None;

        let generation = self.policy.start().ok_or(WireError::Cancelled)?;
        let connection = self
            .policy
            .connect(generation, self.router.channel(), endpoint)
            .await?;

        self.notifier.rearm_terminated();
        self.state.lock().connection = Some(connection);

        // The reader may have seen the remote close before the id was recorded,
        // in which case the pump already skipped it.
        if self.router.channel().connection_id() != Some(connection) {
            connection_closed(
                &self.state,
                &self.router,
                &self.policy,
                &self.notifier,
                connection,
                None,
            );
            return Err(WireError::ConnectionClosed);
        }
        Ok(())
    }

    /// Send every buffered breakpoint set, in path order, and empty the buffer.
    ///
    /// On failure the unsent sets go back into the buffer unless the editor
    /// replaced them in the meantime.
    async fn flush_pending_breakpoints(&self) -> std::result::Result<(), WireError> {
        let pending = std::mem::take(&mut self.state.lock().pending_breakpoints);
        self.log(format!("Pending breakpoints: {}", pending.len()));

        let mut remaining = pending.into_iter();
        while let Some((path, breakpoints)) = remaining.next() {
            self.log(format!(
                "Sending breakpoints for {path}: {}",
                serde_json::to_string(&breakpoints).unwrap_or_default()
            ));
            match self
                .router
                .send("setBreakpoints", set_breakpoints_payload(&path, &breakpoints))
                .await
            {
                Ok(body) => {
                    let reported = list_field::<Breakpoint>(&body, "breakpoints");
                    self.state.lock().reported_breakpoints.insert(path, reported);
                }
                Err(err) => {
                    let mut state = self.state.lock();
                    state.pending_breakpoints.entry(path).or_insert(breakpoints);
                    for (path, breakpoints) in remaining {
                        state.pending_breakpoints.entry(path).or_insert(breakpoints);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn configuration_done(&self) -> Reply {
        self.state.lock().configuration_done = true;
        if self.is_connected() {
            self.fire("configurationDone", json!({}));
        }
        Reply::empty()
    }

    async fn set_breakpoints(&self, args: SetBreakpointsArguments) -> Result<Reply> {
        let path = args.source.path.unwrap_or_default();
        let requested = args.breakpoints;
        tracing::debug!(
            target: "panda.dap",
            path = %path,
            count = requested.len(),
            connected = self.is_connected(),
            "setBreakpoints"
        );

        let reported = match self
            .router
            .send("setBreakpoints", set_breakpoints_payload(&path, &requested))
            .await
        {
            Ok(body) => list_field::<Breakpoint>(&body, "breakpoints"),
            Err(WireError::NotConnected) => {
                let reported = requested
                    .iter()
                    .map(|bp| Breakpoint::verified_at(bp.line))
                    .collect();
                self.state
                    .lock()
                    .pending_breakpoints
                    .insert(path.clone(), requested);
                reported
            }
            Err(err) => return Err(err.into()),
        };

        self.state
            .lock()
            .reported_breakpoints
            .insert(path, reported.clone());
        Ok(Reply::with_body(json!({ "breakpoints": reported })))
    }

    async fn stack_trace(&self, args: ThreadArguments) -> Result<Reply> {
        let frames: Vec<StackFrame> = self
            .query("stackTrace", thread_payload(&args), "stackFrames")
            .await?;
        Ok(Reply::with_body(json!({
            "totalFrames": frames.len(),
            "stackFrames": frames,
        })))
    }

    async fn scopes(&self, args: ScopesArguments) -> Result<Reply> {
        let scopes: Vec<Scope> = self
            .query("scopes", json!({ "frameId": args.frame_id }), "scopes")
            .await?;
        Ok(Reply::with_body(json!({ "scopes": scopes })))
    }

    async fn variables(&self, args: VariablesArguments) -> Result<Reply> {
        let variables: Vec<Variable> = self
            .query(
                "variables",
                json!({ "variablesReference": args.variables_reference }),
                "variables",
            )
            .await?;
        Ok(Reply::with_body(json!({ "variables": variables })))
    }

    /// Run a list query; no connection yields an empty list.
    async fn query<T: DeserializeOwned>(&self, command: &str, arguments: Value, key: &str) -> Result<Vec<T>> {
        match self.router.send(command, arguments).await {
            Ok(body) => Ok(list_field(&body, key)),
            Err(WireError::NotConnected) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn evaluate(&self, args: EvaluateArguments) -> Reply {
        let body = match self.router.send("evaluate", json!(args)).await {
            Ok(body) => {
                let mut result = Map::new();
                let text = match body.get("result") {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                };
                result.insert("result".to_string(), Value::String(text));
                if let Some(ty) = body.get("type").filter(|ty| !ty.is_null()) {
                    result.insert("type".to_string(), ty.clone());
                }
                result.insert(
                    "variablesReference".to_string(),
                    json!(body.get("variablesReference").and_then(Value::as_i64).unwrap_or(0)),
                );
                Value::Object(result)
            }
            Err(WireError::NotConnected) => json!({ "result": "Not connected", "variablesReference": 0 }),
            Err(err) => json!({ "result": format!("Error: {err}"), "variablesReference": 0 }),
        };
        Reply::with_body(body)
    }

    fn disconnect(&self) -> Reply {
        if self.is_connected() {
            self.fire("disconnect", json!({}));
        }
        self.teardown();
        self.policy.stop();
        Reply::empty().followed_by(HostEvent::Terminated)
    }

    fn terminate(&self) -> Reply {
        if self.is_connected() {
            self.fire("terminate", json!({}));
        }
        self.teardown();
        Reply::empty().followed_by(HostEvent::Terminated)
    }

    /// Drop the live connection without the pump reporting it as a remote close.
    fn teardown(&self) {
        let connection = self.state.lock().connection.take();
        if let Some(connection) = connection {
            self.router.channel().close_connection(connection);
            self.policy.connection_lost();
            self.router.fail_pending();
        }
    }

    /// Send a command whose response nobody waits for.
    fn fire(&self, command: &str, arguments: Value) {
        match self.router.dispatch(command, arguments) {
            Ok(reply) => {
                let router = self.router.clone();
                tokio::spawn(async move {
                    let command = reply.command().to_string();
                    if let Err(err) = router.wait(reply).await {
                        tracing::debug!(target: "panda.dap", command = %command, error = %err, "remote command failed");
                    }
                });
            }
            Err(err) => {
                tracing::debug!(target: "panda.dap", command, error = %err, "command not forwarded");
            }
        }
    }

    fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(target: "panda.dap", "{message}");
        self.notifier
            .emit(HostEvent::console(format!("[panda] {message}\n")));
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.policy.stop();
        self.router.channel().close();
        self.router.fail_pending();
    }
}

/// Map one remote event onto the editor's vocabulary. Unknown events are dropped.
pub fn translate_event(event: &EventMessage) -> Option<HostEvent> {
    let text = |key: &str| {
        event
            .body_field(key)
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
    };

    match event.event.as_str() {
        "stopped" => Some(HostEvent::Stopped {
            reason: text("reason").unwrap_or("breakpoint").to_string(),
            thread_id: event
                .body_field("threadId")
                .and_then(Value::as_i64)
                .filter(|id| *id != 0)
                .unwrap_or(THREAD_ID),
        }),
        "output" => Some(HostEvent::Output {
            output: text("output").unwrap_or_default().to_string(),
            category: text("category").unwrap_or("console").to_string(),
        }),
        "terminated" => Some(HostEvent::Terminated),
        other => {
            tracing::debug!(target: "panda.dap", event = other, "dropping unrecognized remote event");
            None
        }
    }
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    router: Arc<MessageRouter>,
    policy: Arc<ReconnectPolicy>,
    state: Arc<Mutex<SessionState>>,
    notifier: HostNotifier,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return;
        };

        match event {
            ChannelEvent::Message { value, .. } => router.on_message(value),
            ChannelEvent::Closed { connection, error } => {
                connection_closed(&state, &router, &policy, &notifier, connection, error.as_deref());
            }
        }
    }
}

/// Report the loss of `connection` to the editor, unless it is no longer the
/// session's connection.
fn connection_closed(
    state: &Mutex<SessionState>,
    router: &MessageRouter,
    policy: &ReconnectPolicy,
    notifier: &HostNotifier,
    connection: ConnectionId,
    error: Option<&str>,
) {
    {
        let mut state = state.lock();
        if state.connection != Some(connection) {
            tracing::debug!(target: "panda.dap", %connection, "ignoring close of superseded connection");
            return;
        }
        state.connection = None;
    }

    router.fail_pending();
    policy.connection_lost();
    tracing::info!(target: "panda.dap", %connection, error = ?error, "debug server connection closed");
    notifier.emit(HostEvent::Terminated);
}

fn parse_args<T>(command: &str, arguments: Value) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if arguments.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(arguments).map_err(|source| BridgeError::InvalidArguments {
        command: command.to_string(),
        source,
    })
}

fn thread_payload(args: &ThreadArguments) -> Value {
    json!({ "threadId": args.thread_id.unwrap_or(THREAD_ID) })
}

fn set_breakpoints_payload(path: &str, breakpoints: &[SourceBreakpoint]) -> Value {
    json!({
        "source": { "path": path },
        "breakpoints": breakpoints,
    })
}
