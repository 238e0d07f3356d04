use std::sync::atomic::{AtomicU64, Ordering};

use panda_config::DebugConfig;
use panda_wire::{codec, EventMessage, FrameCodec, Message, RequestMessage, ResponseMessage};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::host::{HostMessage, HostNotifier};
use crate::session::BridgeSession;

/// Run the debug adapter over stdio.
pub async fn run_stdio(config: DebugConfig) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run(stdin, stdout, config).await.map_err(anyhow::Error::from)
}

/// Serve one editor connection until it disconnects or closes the stream.
///
/// Editor requests are handled one at a time, in arrival order.
pub async fn run<R, W>(mut reader: R, writer: W, config: DebugConfig) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (notifier, out_rx) = HostNotifier::channel();
    let writer_task = tokio::spawn(write_loop(writer, out_rx));
    let session = BridgeSession::new(config, notifier.clone());

    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; 8 * 1024];
    'read: loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let values: Vec<Value> = codec.feed(&buf[..n]).collect();
        for value in values {
            let request = match Message::from_value(value) {
                Ok(Message::Request(request)) => request,
                Ok(_) => continue,
                Err(err) => {
                    tracing::debug!(target: "panda.dap", error = %err, "ignoring malformed editor message");
                    continue;
                }
            };
            if handle_request(&session, &notifier, request).await {
                break 'read;
            }
        }
    }

    drop(session);
    drop(notifier);
    let _ = writer_task.await;
    Ok(())
}

/// Returns `true` once the editor has disconnected.
async fn handle_request(session: &BridgeSession, notifier: &HostNotifier, request: RequestMessage) -> bool {
    let RequestMessage {
        seq,
        command,
        arguments,
    } = request;
    tracing::debug!(target: "panda.dap", seq, command = %command, "editor request");

    match session.handle(&command, arguments).await {
        Ok(reply) => {
            notifier.respond(seq, &command, true, None, reply.body);
            for event in reply.events {
                notifier.emit(event);
            }
        }
        Err(err) => {
            tracing::warn!(target: "panda.dap", command = %command, error = %err, "request failed");
            notifier.respond(seq, &command, false, Some(err.to_string()), None);
        }
    }
    command == "disconnect"
}

async fn write_loop<W>(mut writer: W, mut out_rx: tokio::sync::mpsc::UnboundedReceiver<HostMessage>)
where
    W: AsyncWrite + Unpin,
{
    let seq = AtomicU64::new(1);
    while let Some(msg) = out_rx.recv().await {
        let seq = seq.fetch_add(1, Ordering::Relaxed);
        let message = match msg {
            HostMessage::Response {
                request_seq,
                command,
                success,
                message,
                body,
            } => Message::Response(ResponseMessage {
                seq,
                request_seq,
                success,
                command: Some(command),
                message,
                error: None,
                body,
            }),
            HostMessage::Event(event) => Message::Event(EventMessage {
                seq,
                event: event.name().to_string(),
                body: event.body(),
            }),
        };
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(target: "panda.dap", error = %err, "failed to encode editor message");
                continue;
            }
        };
        if let Err(err) = writer.write_all(&frame).await {
            tracing::debug!(target: "panda.dap", error = %err, "editor stream closed");
            return;
        }
        let _ = writer.flush().await;
    }
}
