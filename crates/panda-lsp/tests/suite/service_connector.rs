use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use panda_config::LanguageServerConfig;
use panda_lsp::{ServiceClient, ServiceConnector, ServiceLink};
use panda_wire::mock::{MockDebugServer, MockDebugServerConfig};
use panda_wire::{BoxedStream, ConnectionId, ConnectionState, Connector, Endpoint};
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Debug)]
enum Note {
    Connected(ConnectionId),
    Message(Value),
    Disconnected(ConnectionId),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Note>,
}

impl ServiceClient for Recorder {
    fn on_connected(&self, connection: ConnectionId, _link: &ServiceLink) {
        let _ = self.tx.send(Note::Connected(connection));
    }

    fn on_message(&self, value: Value) {
        let _ = self.tx.send(Note::Message(value));
    }

    fn on_disconnected(&self, connection: ConnectionId, _error: Option<&str>) {
        let _ = self.tx.send(Note::Disconnected(connection));
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Note>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

pub(crate) fn service_config(port: u16) -> LanguageServerConfig {
    LanguageServerConfig {
        host: "127.0.0.1".to_string(),
        port,
        retry_delay_ms: 20,
        restart_delay_ms: 50,
        connect_timeout_ms: 1_000,
    }
}

async fn next_note(rx: &mut mpsc::UnboundedReceiver<Note>) -> Note {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for connector")
        .expect("connector went away")
}

async fn expect_connected(rx: &mut mpsc::UnboundedReceiver<Note>) -> ConnectionId {
    match next_note(rx).await {
        Note::Connected(id) => id,
        other => panic!("expected a connection, got {other:?}"),
    }
}

pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

struct RefusingConnector {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> io::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }
}

#[tokio::test]
async fn connects_and_carries_traffic_both_ways() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, mut notes) = recorder();
    let connector = ServiceConnector::new(&service_config(server.port()), client);

    assert!(connector.start());
    expect_connected(&mut notes).await;
    assert!(connector.is_connected());
    assert_eq!(connector.state(), ConnectionState::Connected);

    connector
        .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "shutdown"}))
        .unwrap();
    eventually(|| server.received().iter().any(|m| m["method"] == "shutdown")).await;

    server.send_raw(&json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"message": "hi"}}));
    match next_note(&mut notes).await {
        Note::Message(value) => assert_eq!(value["params"]["message"], "hi"),
        other => panic!("expected a message, got {other:?}"),
    }
}

#[tokio::test]
async fn keeps_retrying_until_the_server_comes_up() {
    let addr = unused_addr();
    let (client, mut notes) = recorder();
    let connector = ServiceConnector::new(&service_config(addr.port()), client);
    assert!(connector.start());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!connector.is_connected());
    assert!(matches!(
        connector.state(),
        ConnectionState::Connecting | ConnectionState::Backoff
    ));

    let server = MockDebugServer::spawn_on(addr, MockDebugServerConfig::default())
        .await
        .unwrap();
    expect_connected(&mut notes).await;
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn restarts_after_the_server_drops_the_connection() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, mut notes) = recorder();
    let connector = ServiceConnector::new(&service_config(server.port()), client);
    connector.start();
    let first = expect_connected(&mut notes).await;

    server.drop_connections();
    match next_note(&mut notes).await {
        Note::Disconnected(id) => assert_eq!(id, first),
        other => panic!("expected a disconnect, got {other:?}"),
    }
    let second = expect_connected(&mut notes).await;
    assert_ne!(first, second);
    assert!(server.wait_for_connections(2, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn stop_during_backoff_ends_all_attempts() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let (client, _notes) = recorder();
    let connector = ServiceConnector::with_connector(
        Arc::new(RefusingConnector {
            attempts: attempts.clone(),
        }),
        &service_config(1),
        client,
    );
    connector.start();
    eventually(|| attempts.load(Ordering::SeqCst) >= 2).await;

    connector.stop();
    let seen = attempts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), seen);
    assert_eq!(connector.state(), ConnectionState::Stopped);
    assert!(!connector.start(), "a stopped connector stays stopped");
}

#[tokio::test]
async fn stop_cancels_a_scheduled_restart() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, mut notes) = recorder();
    let config = LanguageServerConfig {
        restart_delay_ms: 200,
        ..service_config(server.port())
    };
    let connector = ServiceConnector::new(&config, client);
    connector.start();
    expect_connected(&mut notes).await;

    server.drop_connections();
    assert!(matches!(next_note(&mut notes).await, Note::Disconnected(_)));
    connector.stop();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.connections(), 1);
    assert!(!connector.is_connected());
}

#[tokio::test]
async fn manual_restart_replaces_the_connection() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, mut notes) = recorder();
    let connector = ServiceConnector::new(&service_config(server.port()), client);
    connector.start();
    let first = expect_connected(&mut notes).await;

    assert!(connector.restart());
    match next_note(&mut notes).await {
        Note::Disconnected(id) => assert_eq!(id, first),
        other => panic!("expected the old connection to be released, got {other:?}"),
    }
    let second = expect_connected(&mut notes).await;
    assert_ne!(first, second);
    assert!(server.wait_for_connections(2, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn reported_stop_restarts_after_the_delay() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, mut notes) = recorder();
    let connector = ServiceConnector::new(&service_config(server.port()), client);
    connector.start();
    let first = expect_connected(&mut notes).await;

    connector.report_stopped();
    assert!(!connector.is_connected());
    match next_note(&mut notes).await {
        Note::Disconnected(id) => assert_eq!(id, first),
        other => panic!("expected a disconnect, got {other:?}"),
    }
    let second = expect_connected(&mut notes).await;
    assert_ne!(first, second);
}

#[tokio::test]
async fn stop_releases_the_live_connection() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (client, mut notes) = recorder();
    let connector = ServiceConnector::new(&service_config(server.port()), client);
    connector.start();
    let first = expect_connected(&mut notes).await;

    connector.stop();
    match next_note(&mut notes).await {
        Note::Disconnected(id) => assert_eq!(id, first),
        other => panic!("expected a disconnect, got {other:?}"),
    }
    assert!(!connector.is_connected());
}
