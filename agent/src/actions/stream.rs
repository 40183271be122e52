//! STREAM action, agent side: run the watch/follow REST call with a
//! streaming body and feed `kube/stream/stdout` chunks back until the body
//! ends or the daemon says stop.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kubelink_core::actions::{
    StreamStartPayload, STREAM_START, STREAM_STOP, STREAM_TYPE_STREAM_STDOUT,
};
use kubelink_core::channel::ChannelHandle;
use kubelink_core::message::{ErrorMessage, StreamMessage};
use kubelink_core::registry::InboundMessage;

use crate::kube::{KubeApi, RestRequest};

pub async fn run<K: KubeApi>(
    kube: K,
    channel: ChannelHandle,
    request_id: String,
    mut rx: mpsc::Receiver<InboundMessage>,
) {
    let mut cancel = channel.cancelled();

    let start: StreamStartPayload = loop {
        let msg = tokio::select! {
            _ = cancel.changed() => return,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };
        match msg {
            InboundMessage::Request { action, payload } if action == STREAM_START => {
                match serde_json::from_slice(&payload) {
                    Ok(start) => break start,
                    Err(e) => {
                        warn!(%request_id, "bad stream start payload: {e}");
                        channel.remove(&request_id).await;
                        return;
                    }
                }
            }
            other => warn!(%request_id, "stream action ignoring: {other:?}"),
        }
    };

    info!(%request_id, endpoint = %start.endpoint, command = %start.kube_command,
          "starting follow stream");
    let mut body = match kube
        .open_rest_stream(RestRequest {
            method: start.method,
            endpoint: start.endpoint,
            headers: start.headers,
            body: Vec::new(),
        })
        .await
    {
        Ok(body) => body,
        Err(e) => {
            warn!(%request_id, "stream open failed: {e}");
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

    let mut seq = 0_u64;
    loop {
        tokio::select! {
            _ = cancel.changed() => break,

            chunk = body.recv() => match chunk {
                Some(chunk) => {
                    let msg =
                        StreamMessage::new(&request_id, STREAM_TYPE_STREAM_STDOUT, seq, &chunk);
                    seq += 1;
                    if channel.send_stream(msg).await.is_err() {
                        break;
                    }
                }
                None => {
                    // upstream body ended: emit the terminal chunk
                    let last =
                        StreamMessage::new(&request_id, STREAM_TYPE_STREAM_STDOUT, seq, &[])
                            .last();
                    let _ = channel.send_stream(last).await;
                    break;
                }
            },

            msg = rx.recv() => match msg {
                Some(InboundMessage::Request { action, .. }) if action == STREAM_STOP => {
                    debug!(%request_id, "stream stopped by the daemon");
                    break;
                }
                Some(other) => warn!(%request_id, "stream action ignoring: {other:?}"),
                None => break,
            },
        }
    }
    channel.remove(&request_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::test_support::FakeKube;
    use kubelink_core::actions::ActionFamily;
    use kubelink_core::channel::{self, SessionChannels};
    use kubelink_core::message::MessageType;
    use kubelink_core::registry::ActionRegistry;
    use std::collections::HashMap;
    use tokio::sync::watch;

    #[tokio::test]
    async fn streams_chunks_in_sequence_then_terminates() {
        let registry = ActionRegistry::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let SessionChannels {
            handle,
            mut outbound_rx,
            ..
        } = channel::session(registry.clone(), cancel_rx);

        let kube = FakeKube::streaming(vec![b"line-1\n".to_vec(), b"line-2\n".to_vec()]);
        let rx = registry.register("r-1", ActionFamily::Stream).await.unwrap();
        tokio::spawn(run(kube, handle, "r-1".to_string(), rx));

        registry
            .deliver(
                "r-1",
                InboundMessage::Request {
                    action: STREAM_START.to_string(),
                    payload: serde_json::to_vec(&StreamStartPayload {
                        request_id: "r-1".to_string(),
                        log_id: "l".to_string(),
                        kube_command: "kubectl logs -f".to_string(),
                        endpoint: "/api/v1/namespaces/default/pods/p/log?follow=true"
                            .to_string(),
                        headers: HashMap::new(),
                        method: "GET".to_string(),
                    })
                    .unwrap(),
                },
            )
            .await
            .unwrap();

        let mut seen = Vec::new();
        loop {
            let envelope = outbound_rx.recv().await.unwrap();
            assert_eq!(envelope.message_type, MessageType::Stream);
            let msg: StreamMessage = envelope.payload().unwrap();
            assert_eq!(msg.stream_type, STREAM_TYPE_STREAM_STDOUT);
            assert_eq!(msg.sequence_number, seen.len() as u64);
            let done = !msg.more;
            seen.push(msg.content_bytes().unwrap());
            if done {
                break;
            }
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], b"line-1\n");
        assert_eq!(seen[1], b"line-2\n");
        assert!(seen[2].is_empty());
    }
}
