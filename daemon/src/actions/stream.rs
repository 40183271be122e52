//! STREAM action, daemon side: long-poll requests (`watch=true`,
//! `log?...follow=true`) whose response body stays open while the agent
//! feeds it `kube/stream/stdout` chunks. Chunks are reordered by sequence
//! number before they reach the body; the local client going away emits
//! `kube/stream/stop`.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::Response;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use kubelink_core::actions::{
    ActionFamily, StopPayload, StreamStartPayload, STREAM_START, STREAM_STOP,
    STREAM_TYPE_STREAM_STDOUT,
};
use kubelink_core::channel::ChannelHandle;
use kubelink_core::registry::InboundMessage;
use kubelink_core::reorder::OrderedQueue;

use super::CommandContext;

/// Depth of the response-body chunk queue.
const BODY_QUEUE_DEPTH: usize = 64;

pub async fn handle(channel: ChannelHandle, meta: CommandContext, req: Request) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let mut rx = match channel.register(&request_id, ActionFamily::Stream).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("stream register failed: {e}");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap_or_default();
        }
    };

    let endpoint = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), ToString::to_string);
    let method = req.method().to_string();
    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    if channel
        .send_action(STREAM_START, &StreamStartPayload {
            request_id: request_id.clone(),
            log_id: meta.log_id.clone(),
            kube_command: meta.kube_command.clone(),
            endpoint,
            headers,
            method,
        })
        .await
        .is_err()
    {
        channel.remove(&request_id).await;
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap_or_default();
    }

    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(BODY_QUEUE_DEPTH);

    tokio::spawn(async move {
        let mut queue = OrderedQueue::default();
        let mut cancel = channel.cancelled();
        'stream: loop {
            let msg = tokio::select! {
                _ = cancel.changed() => break 'stream,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break 'stream,
                },
            };
            match msg {
                InboundMessage::Stream(stream)
                    if stream.stream_type == STREAM_TYPE_STREAM_STDOUT =>
                {
                    let Ok(content) = stream.content_bytes() else {
                        warn!(%request_id, "dropping chunk with bad base64");
                        continue;
                    };
                    let last = !stream.more;
                    let ready = match queue.push(stream.sequence_number, content) {
                        Ok(ready) => ready,
                        Err(e) => {
                            warn!(%request_id, "stream reorder overflow: {e}");
                            break 'stream;
                        }
                    };
                    for chunk in ready {
                        if chunk.is_empty() {
                            continue;
                        }
                        if body_tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                            // Local client went away: tell the agent to stop
                            // producing.
                            debug!(%request_id, "local stream consumer gone");
                            let _ = channel
                                .send_action(STREAM_STOP, &StopPayload {
                                    request_id: request_id.clone(),
                                    log_id: meta.log_id.clone(),
                                })
                                .await;
                            break 'stream;
                        }
                    }
                    if last {
                        debug!(%request_id, "stream ended by the agent");
                        break 'stream;
                    }
                }
                InboundMessage::Error(error) => {
                    warn!(%request_id, "stream failed upstream: {}", error.message);
                    break 'stream;
                }
                other => warn!(%request_id, "stream action ignoring: {other:?}"),
            }
        }
        channel.remove(&request_id).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from_stream(ReceiverStream::new(body_rx)))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelink_core::channel::{self, SessionChannels};
    use kubelink_core::message::{ActionMessage, AgentMessage, StreamMessage};
    use kubelink_core::registry::ActionRegistry;
    use tokio::sync::watch;

    #[tokio::test]
    async fn follow_body_streams_chunks_in_order() {
        let registry = ActionRegistry::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let SessionChannels {
            handle: session_channel,
            mut outbound_rx,
            ..
        } = channel::session(registry.clone(), cancel_rx);

        let req = Request::builder()
            .uri("/api/v1/namespaces/default/pods/p/log?follow=true")
            .body(Body::empty())
            .unwrap();
        let response = handle(session_channel, CommandContext::default(), req).await;

        let start: ActionMessage = outbound_rx
            .recv()
            .await
            .expect("start envelope")
            .payload()
            .unwrap();
        assert_eq!(start.action, STREAM_START);
        let start: StreamStartPayload = start.payload().unwrap();
        assert!(start.endpoint.contains("follow=true"));
        let request_id = start.request_id;

        // chunks 1 then 0 then terminal 2: body sees 0,1,2 in order
        let chunk = |seq: u64, content: &[u8], more: bool| {
            let mut msg = StreamMessage::new(&request_id, STREAM_TYPE_STREAM_STDOUT, seq, content);
            msg.more = more;
            InboundMessage::Stream(msg)
        };
        registry
            .deliver(&request_id, chunk(1, b"line-2\n", true))
            .await
            .unwrap();
        registry
            .deliver(&request_id, chunk(0, b"line-1\n", true))
            .await
            .unwrap();
        registry
            .deliver(&request_id, chunk(2, b"line-3\n", false))
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"line-1\nline-2\nline-3\n");
        assert!(registry.is_empty().await);
    }
}
