//! EXEC action, agent side.
//!
//! `kube/exec/start` opens the remote process through the adapter; the
//! remote's stdout and stderr become `kube/exec/stdout` / `kube/exec/stderr`
//! stream messages with per-type monotonic sequence numbers. Input and
//! resize verbs feed the adapter channels. When the remote side finishes on
//! its own, the reserved sentinel goes out as terminal stdout content.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kubelink_core::actions::{
    ExecInputPayload, ExecResizePayload, ExecStartPayload, EXEC_END_SENTINEL, EXEC_START,
    STREAM_TYPE_EXEC_STDERR, STREAM_TYPE_EXEC_STDOUT,
};
use kubelink_core::channel::ChannelHandle;
use kubelink_core::message::{ErrorMessage, StreamMessage};
use kubelink_core::registry::InboundMessage;

use crate::kube::{ExecSpec, KubeApi};

pub async fn run<K: KubeApi>(
    kube: K,
    channel: ChannelHandle,
    request_id: String,
    mut rx: mpsc::Receiver<InboundMessage>,
) {
    let mut cancel = channel.cancelled();

    // The first message must carry the start payload.
    let start: ExecStartPayload = loop {
        let msg = tokio::select! {
            _ = cancel.changed() => return,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };
        match msg {
            InboundMessage::Request { action, payload } if action == EXEC_START => {
                match serde_json::from_slice(&payload) {
                    Ok(start) => break start,
                    Err(e) => {
                        warn!(%request_id, "bad exec start payload: {e}");
                        channel.remove(&request_id).await;
                        return;
                    }
                }
            }
            other => warn!(%request_id, "exec action ignoring: {other:?}"),
        }
    };

    info!(%request_id, endpoint = %start.endpoint, tty = start.is_tty, "starting exec");
    let channels = match kube
        .open_exec(ExecSpec {
            endpoint: start.endpoint.clone(),
            command: start.command.clone(),
            tty: start.is_tty,
        })
        .await
    {
        Ok(channels) => channels,
        Err(e) => {
            warn!(%request_id, "exec open failed: {e}");
            let _ = channel
                .send_error(ErrorMessage {
                    request_id: request_id.clone(),
                    message: e.to_string(),
                })
                .await;
            channel.remove(&request_id).await;
            return;
        }
    };

    // Output pumps: one per stream, each with its own sequence space. The
    // stdout pump owns the end-of-stream sentinel.
    let stdout_pump = tokio::spawn(pump_output(
        channels.stdout,
        channel.clone(),
        request_id.clone(),
        STREAM_TYPE_EXEC_STDOUT,
        true,
    ));
    let stderr_pump = tokio::spawn(pump_output(
        channels.stderr,
        channel.clone(),
        request_id.clone(),
        STREAM_TYPE_EXEC_STDERR,
        false,
    ));

    let stdin = channels.stdin;
    let resize = channels.resize;
    loop {
        let msg = tokio::select! {
            _ = cancel.changed() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let InboundMessage::Request { action, payload } = msg else {
            warn!(%request_id, "exec action ignoring non-request message");
            continue;
        };
        match action.as_str() {
            kubelink_core::actions::EXEC_INPUT => {
                let Ok(input) = serde_json::from_slice::<ExecInputPayload>(&payload) else {
                    warn!(%request_id, "bad exec input payload");
                    continue;
                };
                if stdin.send(input.stdin).await.is_err() {
                    debug!(%request_id, "remote stdin closed");
                    break;
                }
            }
            kubelink_core::actions::EXEC_RESIZE => {
                let Ok(size) = serde_json::from_slice::<ExecResizePayload>(&payload) else {
                    warn!(%request_id, "bad exec resize payload");
                    continue;
                };
                let _ = resize.send((size.width, size.height)).await;
            }
            kubelink_core::actions::EXEC_STOP => {
                debug!(%request_id, "exec stopped by the daemon");
                break;
            }
            other => warn!(%request_id, action = other, "unknown exec verb"),
        }
    }

    // Dropping stdin/resize tears the remote connection down; the pumps end
    // when their queues drain.
    drop(stdin);
    drop(resize);
    stdout_pump.abort();
    stderr_pump.abort();
    channel.remove(&request_id).await;
}

/// Forward remote output chunks as sequenced stream messages. When the
/// remote end closes and this pump owns the sentinel, a terminal chunk with
/// the reserved marker tells the daemon the exec finished on its own.
async fn pump_output(
    mut output: mpsc::Receiver<Vec<u8>>,
    channel: ChannelHandle,
    request_id: String,
    stream_type: &'static str,
    send_sentinel: bool,
) {
    let mut seq = 0_u64;
    while let Some(chunk) = output.recv().await {
        let msg = StreamMessage::new(&request_id, stream_type, seq, &chunk);
        seq += 1;
        if channel.send_stream(msg).await.is_err() {
            return;
        }
    }
    if send_sentinel {
        let last = StreamMessage::new(&request_id, stream_type, seq, EXEC_END_SENTINEL).last();
        let _ = channel.send_stream(last).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::test_support::FakeKube;
    use kubelink_core::actions::{ActionFamily, EXEC_INPUT, EXEC_RESIZE};
    use kubelink_core::channel::{self, SessionChannels};
    use kubelink_core::message::{AgentMessage, MessageType};
    use kubelink_core::registry::ActionRegistry;
    use tokio::sync::watch;

    fn request(action: &str, payload: &impl serde::Serialize) -> InboundMessage {
        InboundMessage::Request {
            action: action.to_string(),
            payload: serde_json::to_vec(payload).unwrap(),
        }
    }

    async fn next_stream(outbound_rx: &mut mpsc::Receiver<AgentMessage>) -> StreamMessage {
        let envelope = outbound_rx.recv().await.unwrap();
        assert_eq!(envelope.message_type, MessageType::Stream);
        envelope.payload().unwrap()
    }

    #[tokio::test]
    async fn start_pump_and_sentinel() {
        let registry = ActionRegistry::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let SessionChannels {
            handle,
            mut outbound_rx,
            ..
        } = channel::session(registry.clone(), cancel_rx);

        let (kube, mut remote) = FakeKube::with_exec();
        let rx = registry.register("r-1", ActionFamily::Exec).await.unwrap();
        tokio::spawn(run(kube, handle, "r-1".to_string(), rx));

        registry
            .deliver(
                "r-1",
                request(EXEC_START, &ExecStartPayload {
                    request_id: "r-1".to_string(),
                    log_id: "l".to_string(),
                    is_tty: true,
                    command: vec!["echo".to_string(), "hi".to_string()],
                    endpoint: "/exec".to_string(),
                }),
            )
            .await
            .unwrap();

        // input and resize verbs reach the remote process
        registry
            .deliver(
                "r-1",
                request(EXEC_INPUT, &ExecInputPayload {
                    request_id: "r-1".to_string(),
                    log_id: "l".to_string(),
                    stdin: b"whoami\n".to_vec(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(remote.stdin.recv().await.unwrap(), b"whoami\n");

        registry
            .deliver(
                "r-1",
                request(EXEC_RESIZE, &ExecResizePayload {
                    request_id: "r-1".to_string(),
                    log_id: "l".to_string(),
                    width: 100,
                    height: 30,
                }),
            )
            .await
            .unwrap();
        assert_eq!(remote.resize.recv().await.unwrap(), (100, 30));

        // remote output becomes sequenced stream messages
        remote.stdout.send(b"hi\n".to_vec()).await.unwrap();
        let first = next_stream(&mut outbound_rx).await;
        assert_eq!(first.stream_type, STREAM_TYPE_EXEC_STDOUT);
        assert_eq!(first.sequence_number, 0);
        assert_eq!(first.content_bytes().unwrap(), b"hi\n");
        assert!(first.more);

        // remote end closes: the sentinel goes out as the terminal chunk
        drop(remote.stdout);
        let last = next_stream(&mut outbound_rx).await;
        assert_eq!(last.sequence_number, 1);
        assert_eq!(last.content_bytes().unwrap(), EXEC_END_SENTINEL);
        assert!(!last.more);
    }

    #[tokio::test]
    async fn stderr_has_its_own_sequence_space() {
        let registry = ActionRegistry::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let SessionChannels {
            handle,
            mut outbound_rx,
            ..
        } = channel::session(registry.clone(), cancel_rx);

        let (kube, remote) = FakeKube::with_exec();
        let rx = registry.register("r-2", ActionFamily::Exec).await.unwrap();
        tokio::spawn(run(kube, handle, "r-2".to_string(), rx));

        registry
            .deliver(
                "r-2",
                request(EXEC_START, &ExecStartPayload {
                    request_id: "r-2".to_string(),
                    log_id: "l".to_string(),
                    is_tty: false,
                    command: vec!["sh".to_string()],
                    endpoint: "/exec".to_string(),
                }),
            )
            .await
            .unwrap();

        remote.stderr.send(b"oops-1".to_vec()).await.unwrap();
        remote.stderr.send(b"oops-2".to_vec()).await.unwrap();

        let first = next_stream(&mut outbound_rx).await;
        assert_eq!(first.stream_type, STREAM_TYPE_EXEC_STDERR);
        assert_eq!(first.sequence_number, 0);
        let second = next_stream(&mut outbound_rx).await;
        assert_eq!(second.sequence_number, 1);
    }
}
