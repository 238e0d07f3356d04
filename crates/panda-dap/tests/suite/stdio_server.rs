use std::collections::VecDeque;
use std::time::Duration;

use panda_config::DebugConfig;
use panda_dap::server;
use panda_wire::{codec, mock::MockDebugServer, FrameCodec};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

struct Editor {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    codec: FrameCodec,
    decoded: VecDeque<Value>,
}

impl Editor {
    async fn send_request(&mut self, seq: u64, command: &str, arguments: Value) {
        let msg = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.writer
            .write_all(&codec::encode(&msg).unwrap())
            .await
            .unwrap();
    }

    async fn read_next(&mut self) -> Value {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(value) = self.decoded.pop_front() {
                return value;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read(&mut buf))
                .await
                .expect("timed out waiting for adapter output")
                .unwrap();
            assert!(n > 0, "adapter closed its output");
            self.decoded.extend(self.codec.feed(&buf[..n]));
        }
    }

    async fn read_until_response(&mut self, request_seq: u64) -> (Value, Vec<Value>) {
        let mut other = Vec::new();
        for _ in 0..200 {
            let msg = self.read_next().await;
            if msg.get("type").and_then(|v| v.as_str()) == Some("response")
                && msg.get("request_seq").and_then(|v| v.as_u64()) == Some(request_seq)
            {
                return (msg, other);
            }
            other.push(msg);
        }
        panic!("did not receive response for seq {request_seq}");
    }
}

fn is_event(msg: &Value, name: &str) -> bool {
    msg.get("type").and_then(|v| v.as_str()) == Some("event")
        && msg.get("event").and_then(|v| v.as_str()) == Some(name)
}

fn local_config(port: u16) -> DebugConfig {
    DebugConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..DebugConfig::default()
    }
}

fn spawn_adapter(config: DebugConfig) -> (Editor, tokio::task::JoinHandle<std::io::Result<()>>) {
    let (client, server_stream) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_stream);
    let task = tokio::spawn(server::run(server_read, server_write, config));

    let (reader, writer) = tokio::io::split(client);
    (
        Editor {
            reader,
            writer,
            codec: FrameCodec::new(),
            decoded: VecDeque::new(),
        },
        task,
    )
}

#[tokio::test]
async fn full_session_over_stdio_framing() {
    let remote = MockDebugServer::spawn().await.unwrap();
    remote.respond_with(
        "stackTrace",
        json!({"stackFrames": [{"id": 1, "name": "main", "line": 3, "column": 1}]}),
    );
    let (mut editor, task) = spawn_adapter(local_config(1));

    editor.send_request(1, "initialize", json!({"adapterID": "panda"})).await;
    let (init, before) = editor.read_until_response(1).await;
    assert_eq!(init["success"], true);
    assert_eq!(init["command"], "initialize");
    assert_eq!(init["body"]["supportsTerminateRequest"], true);
    assert_eq!(init["body"]["supportsSetVariable"], false);
    assert!(before.iter().any(|msg| is_event(msg, "output")
        && msg["body"]["output"] == "[panda] Debug adapter initialized\n"));
    let initialized = editor.read_next().await;
    assert!(is_event(&initialized, "initialized"), "{initialized}");

    editor
        .send_request(
            2,
            "setBreakpoints",
            json!({"source": {"path": "/a.panda"}, "breakpoints": [{"line": 3}]}),
        )
        .await;
    let (bps, _) = editor.read_until_response(2).await;
    assert_eq!(bps["body"]["breakpoints"][0]["verified"], true);

    editor
        .send_request(
            3,
            "launch",
            json!({"program": "/w/main.panda", "stopOnEntry": true, "debugServer": remote.port()}),
        )
        .await;
    let (launch, _) = editor.read_until_response(3).await;
    assert_eq!(launch["success"], true, "{launch}");
    let stopped = editor.read_next().await;
    assert!(is_event(&stopped, "stopped"), "{stopped}");
    assert_eq!(stopped["body"]["reason"], "entry");
    assert_eq!(stopped["body"]["threadId"], 1);

    editor.send_request(4, "stackTrace", json!({"threadId": 1})).await;
    let (stack, _) = editor.read_until_response(4).await;
    assert_eq!(stack["body"]["totalFrames"], 1);
    assert_eq!(stack["body"]["stackFrames"][0]["name"], "main");

    remote.send_event("stopped", Some(json!({"reason": "breakpoint", "threadId": 7})));
    let event = loop {
        let msg = editor.read_next().await;
        if is_event(&msg, "stopped") {
            break msg;
        }
    };
    assert_eq!(event["body"], json!({"reason": "breakpoint", "threadId": 7}));

    editor.send_request(5, "disconnect", json!({})).await;
    let (disconnect, _) = editor.read_until_response(5).await;
    assert_eq!(disconnect["success"], true);
    let terminated = editor.read_next().await;
    assert!(is_event(&terminated, "terminated"), "{terminated}");

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("adapter did not exit after disconnect")
        .unwrap()
        .unwrap();
    assert!(remote.wait_for_command("disconnect", Duration::from_secs(5)).await.is_some());
}

#[tokio::test]
async fn failures_become_error_responses() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (mut editor, task) = spawn_adapter(local_config(port));

    editor.send_request(1, "launch", json!({"program": "/w/main.panda"})).await;
    let (launch, _) = editor.read_until_response(1).await;
    assert_eq!(launch["success"], false);
    assert!(launch["message"]
        .as_str()
        .unwrap()
        .starts_with("Failed to connect to debug server: "));

    editor.send_request(2, "scopes", json!({"frameId": "not a number"})).await;
    let (scopes, _) = editor.read_until_response(2).await;
    assert_eq!(scopes["success"], false);

    editor.send_request(3, "evaluate", json!({"expression": "x"})).await;
    let (evaluate, _) = editor.read_until_response(3).await;
    assert_eq!(evaluate["success"], true);
    assert_eq!(evaluate["body"]["result"], "Not connected");

    drop(editor);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("adapter did not exit after the editor went away")
        .unwrap()
        .unwrap();
}
