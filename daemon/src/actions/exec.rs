//! EXEC action, daemon side.
//!
//! The local client upgrades its exec request and opens one stream per
//! channel (`error` always, plus `stdin`/`stdout`/`stderr` as requested and
//! `resize` under a tty). Local stdin and resize records pump toward the
//! agent; `kube/exec/stdout` / `kube/exec/stderr` stream messages come back,
//! are reordered by sequence number, and land on the matching local stream.
//! A reserved sentinel as stdout content means the remote end finished:
//! the connection is closed and `kube/exec/stop` emitted.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kubelink_core::actions::{
    ActionFamily, ExecInputPayload, ExecResizePayload, ExecStartPayload, StopPayload,
    EXEC_END_SENTINEL, EXEC_INPUT, EXEC_RESIZE, EXEC_START, EXEC_STOP, STREAM_TYPE_EXEC_STDERR,
    STREAM_TYPE_EXEC_STDOUT,
};
use kubelink_core::channel::ChannelHandle;
use kubelink_core::registry::InboundMessage;
use kubelink_core::reorder::OrderedQueue;

use crate::spdy::{self, SpdySession, SpdyStream, STREAM_CREATION_TIMEOUT};

use super::CommandContext;

/// Terminal geometry record read from the resize stream.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

/// What the local client asked for, parsed from the exec URL query.
#[derive(Debug, Clone)]
pub struct ExecParams {
    pub endpoint: String,
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

impl ExecParams {
    pub fn from_request(req: &Request) -> Self {
        let mut command = Vec::new();
        let mut stdin = false;
        let mut stdout = false;
        let mut stderr = false;
        let mut tty = false;
        if let Some(query) = req.uri().query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "command" => command.push(value.into_owned()),
                    "stdin" => stdin = value == "true",
                    "stdout" => stdout = value == "true",
                    "stderr" => stderr = value == "true",
                    "tty" => tty = value == "true",
                    _ => {}
                }
            }
        }
        let endpoint = req
            .uri()
            .path_and_query()
            .map_or_else(|| req.uri().path().to_string(), ToString::to_string);
        Self {
            endpoint,
            command,
            stdin,
            stdout,
            stderr,
            tty,
        }
    }

    /// `1 + stdin + stdout + stderr + tty`: the error stream always exists.
    pub fn expected_streams(&self) -> usize {
        1 + usize::from(self.stdin)
            + usize::from(self.stdout)
            + usize::from(self.stderr)
            + usize::from(self.tty)
    }
}

/// Upgrade the request and run the exec session on the upgraded connection.
pub fn handle(channel: ChannelHandle, meta: CommandContext, mut req: Request) -> Response {
    let offered: Vec<&str> = req
        .headers()
        .get_all(spdy::STREAM_PROTOCOL_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let Some(protocol) = spdy::negotiate_protocol(offered) else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Body::from("no supported stream protocol offered"))
            .unwrap_or_default();
    };

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("connection does not support upgrade"))
            .unwrap_or_default();
    };

    let params = ExecParams::from_request(&req);
    info!(endpoint = %params.endpoint, tty = params.tty, "exec upgrade accepted");

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("exec upgrade failed: {e}");
                return;
            }
        };
        let session = SpdySession::new(TokioIo::new(upgraded), false);
        run_session(channel, meta, params, session).await;
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "SPDY/3.1")
        .header(spdy::STREAM_PROTOCOL_HEADER, protocol)
        .body(Body::empty())
        .unwrap_or_default()
}

/// Drive one exec over an established stream session. Separated from the
/// HTTP layer so the protocol logic is testable over any duplex pipe.
pub async fn run_session(
    channel: ChannelHandle,
    meta: CommandContext,
    params: ExecParams,
    mut session: SpdySession,
) {
    let mut streams = match session
        .accept_streams(params.expected_streams(), STREAM_CREATION_TIMEOUT)
        .await
    {
        Ok(streams) => streams,
        Err(e) => {
            // No start envelope has been emitted; the local client just
            // loses the connection.
            warn!("exec aborted before start: {e}");
            return;
        }
    };

    let request_id = Uuid::new_v4().to_string();
    let mut rx = match channel.register(&request_id, ActionFamily::Exec).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("exec register failed: {e}");
            return;
        }
    };

    if channel
        .send_action(EXEC_START, &ExecStartPayload {
            request_id: request_id.clone(),
            log_id: meta.log_id.clone(),
            is_tty: params.tty,
            command: params.command.clone(),
            endpoint: params.endpoint.clone(),
        })
        .await
        .is_err()
    {
        channel.remove(&request_id).await;
        return;
    }

    // Local-source pumps.
    if let Some(stdin) = streams.remove("stdin") {
        tokio::spawn(pump_stdin(
            stdin,
            channel.clone(),
            request_id.clone(),
            meta.log_id.clone(),
        ));
    }
    if params.tty {
        if let Some(resize) = streams.remove("resize") {
            tokio::spawn(pump_resize(
                resize,
                channel.clone(),
                request_id.clone(),
                meta.log_id.clone(),
            ));
        }
    }

    let stdout_stream = streams.remove("stdout");
    let stderr_stream = streams.remove("stderr");
    let error_stream = streams.remove("error");

    let mut stdout_queue = OrderedQueue::default();
    let mut stderr_queue = OrderedQueue::default();
    let mut closed = session.closed();
    let mut cancel = channel.cancelled();

    'session: loop {
        let msg = tokio::select! {
            _ = cancel.changed() => break 'session,
            _ = closed.changed() => {
                debug!(%request_id, "local exec connection closed");
                break 'session;
            }
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break 'session,
            },
        };

        match msg {
            InboundMessage::Stream(stream) => {
                let Ok(content) = stream.content_bytes() else {
                    warn!(%request_id, "dropping stream chunk with bad base64");
                    continue;
                };
                let (queue, sink) = match stream.stream_type.as_str() {
                    STREAM_TYPE_EXEC_STDOUT => (&mut stdout_queue, stdout_stream.as_ref()),
                    STREAM_TYPE_EXEC_STDERR => (&mut stderr_queue, stderr_stream.as_ref()),
                    other => {
                        warn!(%request_id, stream_type = other, "unexpected stream type");
                        continue;
                    }
                };
                let is_stdout = stream.stream_type == STREAM_TYPE_EXEC_STDOUT;
                let ready = match queue.push(stream.sequence_number, content) {
                    Ok(ready) => ready,
                    Err(e) => {
                        warn!(%request_id, "exec stream reorder overflow: {e}");
                        break 'session;
                    }
                };
                for chunk in ready {
                    if is_stdout && chunk == EXEC_END_SENTINEL {
                        // Remote end finished; close our side of the
                        // connection, which also ends this loop.
                        info!(%request_id, "exec stream ended by the remote end");
                        break 'session;
                    }
                    if let Some(sink) = sink {
                        if sink.write(&chunk).await.is_err() {
                            break 'session;
                        }
                    }
                }
            }
            InboundMessage::Error(error) => {
                warn!(%request_id, "exec failed upstream: {}", error.message);
                if let Some(error_stream) = error_stream.as_ref() {
                    let _ = error_stream.write(error.message.as_bytes()).await;
                }
                break 'session;
            }
            InboundMessage::Request { action, .. } => {
                warn!(%request_id, %action, "unexpected request-bearing message");
            }
        }
    }

    // Tear down: close local streams, tell the agent to stop.
    if let Some(stdout) = stdout_stream {
        stdout.close().await;
    }
    if let Some(stderr) = stderr_stream {
        stderr.close().await;
    }
    let _ = channel
        .send_action(EXEC_STOP, &StopPayload {
            request_id: request_id.clone(),
            log_id: meta.log_id,
        })
        .await;
    channel.remove(&request_id).await;
}

/// Read local stdin chunks and forward them as `kube/exec/input`.
async fn pump_stdin(
    mut stdin: SpdyStream,
    channel: ChannelHandle,
    request_id: String,
    log_id: String,
) {
    let mut cancel = channel.cancelled();
    loop {
        let chunk = tokio::select! {
            _ = cancel.changed() => return,
            chunk = stdin.read() => chunk,
        };
        let Some(chunk) = chunk else { return };
        if channel
            .send_action(EXEC_INPUT, &ExecInputPayload {
                request_id: request_id.clone(),
                log_id: log_id.clone(),
                stdin: chunk,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Decode JSON geometry records from the resize stream and forward them as
/// `kube/exec/resize`.
async fn pump_resize(
    mut resize: SpdyStream,
    channel: ChannelHandle,
    request_id: String,
    log_id: String,
) {
    let mut records = JsonRecordBuffer::default();
    let mut cancel = channel.cancelled();
    loop {
        let chunk = tokio::select! {
            _ = cancel.changed() => return,
            chunk = resize.read() => chunk,
        };
        let Some(chunk) = chunk else { return };
        for size in records.push::<TerminalSize>(&chunk) {
            if channel
                .send_action(EXEC_RESIZE, &ExecResizePayload {
                    request_id: request_id.clone(),
                    log_id: log_id.clone(),
                    width: size.width,
                    height: size.height,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// Accumulates bytes and yields complete JSON documents as they arrive,
/// tolerating records split across chunks.
#[derive(Debug, Default)]
pub struct JsonRecordBuffer {
    buf: Vec<u8>,
}

impl JsonRecordBuffer {
    pub fn push<T: serde::de::DeserializeOwned>(&mut self, chunk: &[u8]) -> Vec<T> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut consumed = 0;
        {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<T>();
            loop {
                match stream.next() {
                    Some(Ok(value)) => {
                        out.push(value);
                        consumed = stream.byte_offset();
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(_)) => {
                        // Unparseable garbage: drop the buffer rather than
                        // loop on it forever.
                        consumed = self.buf.len();
                        break;
                    }
                    None => break,
                }
            }
        }
        self.buf.drain(..consumed);
        out
    }
}
