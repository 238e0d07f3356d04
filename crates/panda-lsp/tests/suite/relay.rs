use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use panda_config::LanguageServerConfig;
use panda_lsp::{relay, Relay, ServiceConnector};
use panda_wire::{codec, mock::MockDebugServer, FrameCodec};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::service_connector::{eventually, service_config};

fn initialize(id: u64) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": "initialize", "params": {"processId": null}})
}

fn initialized() -> Value {
    json!({"jsonrpc": "2.0", "method": "initialized", "params": {}})
}

fn methods(server: &MockDebugServer) -> Vec<String> {
    server
        .received()
        .iter()
        .filter_map(|m| m["method"].as_str().map(str::to_string))
        .collect()
}

async fn next_for_editor(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for relayed message")
        .expect("relay went away")
}

#[tokio::test]
async fn replays_handshake_and_flushes_queue_after_reconnect() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (editor_tx, mut editor_rx) = mpsc::unbounded_channel();
    let relay = Arc::new(Relay::new(editor_tx));
    let config = LanguageServerConfig {
        restart_delay_ms: 300,
        ..service_config(server.port())
    };
    let connector = ServiceConnector::new(&config, relay.clone());
    let link = connector.link();
    connector.start();
    eventually(|| connector.is_connected()).await;

    relay.forward(&link, initialize(1));
    relay.forward(&link, initialized());
    eventually(|| server.received().len() == 2).await;
    server.send_raw(&json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}}));
    assert_eq!(next_for_editor(&mut editor_rx).await["id"], 1);

    server.drop_connections();
    eventually(|| !connector.is_connected()).await;
    relay.forward(
        &link,
        json!({"jsonrpc": "2.0", "method": "textDocument/didOpen", "params": {"uri": "file:///a.panda"}}),
    );
    assert_eq!(relay.queued_len(), 1);

    eventually(|| server.received().len() == 5).await;
    assert_eq!(
        methods(&server),
        vec![
            "initialize",
            "initialized",
            "initialize",
            "initialized",
            "textDocument/didOpen"
        ]
    );
    assert_eq!(relay.queued_len(), 0);

    // The editor already has its initialize result; the replayed one is dropped.
    server.send_raw(&json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}}));
    server.send_raw(&json!({"jsonrpc": "2.0", "method": "textDocument/publishDiagnostics", "params": {}}));
    let next = next_for_editor(&mut editor_rx).await;
    assert_eq!(next["method"], "textDocument/publishDiagnostics");
}

#[tokio::test]
async fn messages_before_the_first_connection_are_delivered_in_order() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (editor_tx, _editor_rx) = mpsc::unbounded_channel();
    let relay = Arc::new(Relay::new(editor_tx));
    let connector = ServiceConnector::new(&service_config(addr.port()), relay.clone());
    let link = connector.link();
    connector.start();

    relay.forward(&link, initialize(1));
    relay.forward(&link, initialized());
    assert_eq!(relay.queued_len(), 2);

    let server = MockDebugServer::spawn_on(addr, Default::default()).await.unwrap();
    eventually(|| server.received().len() == 2).await;
    // Never replayed: this connection is the first to see the handshake.
    assert_eq!(methods(&server), vec!["initialize", "initialized"]);
}

#[tokio::test]
async fn stdio_relay_passes_traffic_and_exits_on_eof() {
    let server = MockDebugServer::spawn().await.unwrap();
    let (editor, relay_side) = tokio::io::duplex(64 * 1024);
    let (relay_read, relay_write) = tokio::io::split(relay_side);
    let task = tokio::spawn(relay::run(relay_read, relay_write, service_config(server.port())));
    let (mut editor_read, mut editor_write) = tokio::io::split(editor);

    assert!(server.wait_for_connections(1, Duration::from_secs(5)).await);
    editor_write
        .write_all(&codec::encode(&initialize(1)).unwrap())
        .await
        .unwrap();
    eventually(|| methods(&server) == vec!["initialize"]).await;

    server.send_raw(&json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}}));
    let mut codec = FrameCodec::new();
    let mut decoded = VecDeque::new();
    let mut buf = [0u8; 4096];
    let response = loop {
        if let Some(value) = decoded.pop_front() {
            break value;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), editor_read.read(&mut buf))
            .await
            .expect("timed out waiting for relay output")
            .unwrap();
        assert!(n > 0, "relay closed its output");
        decoded.extend(codec.feed(&buf[..n]));
    };
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"], json!({"capabilities": {}}));

    drop(editor_write);
    drop(editor_read);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("relay did not exit after the editor went away")
        .unwrap()
        .unwrap();
}
