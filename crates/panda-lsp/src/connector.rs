use std::{sync::Arc, time::Duration};

use panda_config::LanguageServerConfig;
use panda_wire::{
    ChannelConfig, ChannelEvent, ConnectionId, ConnectionState, Connector, Endpoint, Generation,
    ReconnectPolicy, ResilientChannel, Result, TcpConnector,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Sending half of the service connection, handed to [`ServiceClient`]s.
#[derive(Clone)]
pub struct ServiceLink {
    channel: ResilientChannel,
}

impl ServiceLink {
    pub fn send(&self, message: &Value) -> Result<()> {
        self.channel.send(message)
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        let (channel, _events) = ResilientChannel::tcp(Duration::from_secs(1));
        Self { channel }
    }
}

/// Receives the traffic and lifecycle of a [`ServiceConnector`].
pub trait ServiceClient: Send + Sync {
    /// Called once per established connection, before any message from it is
    /// delivered. `link` is already usable.
    fn on_connected(&self, _connection: ConnectionId, _link: &ServiceLink) {}

    fn on_message(&self, value: Value);

    fn on_disconnected(&self, _connection: ConnectionId, _error: Option<&str>) {}
}

struct Inner {
    channel: ResilientChannel,
    policy: ReconnectPolicy,
    endpoint: Endpoint,
    restart_delay: Duration,
    current: Mutex<Option<ConnectionId>>,
    client: Arc<dyn ServiceClient>,
    shutdown: CancellationToken,
}

/// Keeps the language-service connection available for the life of a session.
///
/// Connect failures are retried at a flat delay until [`ServiceConnector::stop`].
/// A connection that drops (or that the client reports as stopped) is restarted
/// after a separate, longer delay.
pub struct ServiceConnector {
    inner: Arc<Inner>,
}

impl ServiceConnector {
    /// Must be called inside a tokio runtime.
    pub fn new(config: &LanguageServerConfig, client: Arc<dyn ServiceClient>) -> Self {
        let connector = Arc::new(TcpConnector {
            connect_timeout: config.connect_timeout(),
        });
        Self::with_connector(connector, config, client)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        config: &LanguageServerConfig,
        client: Arc<dyn ServiceClient>,
    ) -> Self {
        let (channel, events) = ResilientChannel::new(connector, ChannelConfig::default());
        let inner = Arc::new(Inner {
            channel,
            policy: ReconnectPolicy::continuous(config.retry_delay()),
            endpoint: Endpoint::new(config.host.clone(), config.port),
            restart_delay: config.restart_delay(),
            current: Mutex::new(None),
            client,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(pump(inner.clone(), events));
        Self { inner }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn link(&self) -> ServiceLink {
        ServiceLink {
            channel: self.inner.channel.clone(),
        }
    }

    /// Begin connecting. Any earlier connection or retry loop is abandoned.
    ///
    /// Returns `false` once stopped.
    pub fn start(&self) -> bool {
        let Some(generation) = self.inner.policy.start() else {
            return false;
        };
        tracing::info!(target: "panda.lsp", endpoint = %self.inner.endpoint, %generation, "starting language service connection");
        self.release_current("restarted");
        tokio::spawn(connect_task(self.inner.clone(), generation));
        true
    }

    /// Drop the current connection and connect again right away.
    pub fn restart(&self) -> bool {
        tracing::info!(target: "panda.lsp", "restarting language service connection");
        self.start()
    }

    /// Tear down for good. Pending retries and delayed restarts never fire.
    pub fn stop(&self) {
        if self.inner.policy.is_stopped() {
            return;
        }
        tracing::info!(target: "panda.lsp", "stopping language service connection");
        self.inner.policy.stop();
        self.release_current("stopped");
        self.inner.shutdown.cancel();
    }

    /// Close the live connection ourselves. Its `Closed` event will no longer
    /// match `current`, so the client hears about it here instead.
    fn release_current(&self, reason: &str) {
        let previous = self.inner.current.lock().take();
        self.inner.channel.close();
        if let Some(connection) = previous {
            self.inner.client.on_disconnected(connection, Some(reason));
        }
    }

    /// The consuming client saw the session stop; restart after the restart delay.
    pub fn report_stopped(&self) {
        let Some(connection) = *self.inner.current.lock() else {
            return;
        };
        self.inner.channel.close_connection(connection);
        connection_lost(&self.inner, connection, Some("stopped by client"));
    }

    pub fn send(&self, message: &Value) -> Result<()> {
        self.inner.channel.send(message)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current.lock().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.policy.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.policy.subscribe()
    }
}

impl Drop for ServiceConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn connect_task(inner: Arc<Inner>, generation: Generation) {
    let connection = match inner
        .policy
        .connect(generation, &inner.channel, &inner.endpoint)
        .await
    {
        Ok(connection) => connection,
        Err(err) => {
            tracing::debug!(target: "panda.lsp", %generation, error = %err, "connect loop abandoned");
            return;
        }
    };

    *inner.current.lock() = Some(connection);
    tracing::info!(target: "panda.lsp", %connection, "Language server connected");
    inner.client.on_connected(
        connection,
        &ServiceLink {
            channel: inner.channel.clone(),
        },
    );

    // The connection may have dropped before it was recorded as current.
    if inner.channel.connection_id() != Some(connection) {
        connection_lost(&inner, connection, None);
    }
}

fn connection_lost(inner: &Arc<Inner>, connection: ConnectionId, error: Option<&str>) {
    let was_current = {
        let mut current = inner.current.lock();
        if *current == Some(connection) {
            *current = None;
            true
        } else {
            false
        }
    };
    if !was_current {
        return;
    }

    inner.client.on_disconnected(connection, error);
    let Some(generation) = inner.policy.connection_lost() else {
        return;
    };
    tracing::warn!(
        target: "panda.lsp",
        %connection,
        error = ?error,
        restart_in = ?inner.restart_delay,
        "language service connection lost"
    );

    let inner = inner.clone();
    tokio::spawn(async move {
        if !inner.policy.wait(generation, inner.restart_delay).await {
            return;
        }
        if let Some(generation) = inner.policy.restart_if_current(generation) {
            connect_task(inner, generation).await;
        }
    });
}

async fn pump(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return;
        };

        match event {
            ChannelEvent::Message { connection, value } => match inner.channel.connection_id() {
                Some(live) if live != connection => {
                    tracing::trace!(target: "panda.lsp", %connection, "dropping message from superseded connection");
                }
                _ => inner.client.on_message(value),
            },
            ChannelEvent::Closed { connection, error } => {
                connection_lost(&inner, connection, error.as_deref());
            }
        }
    }
}
