//! PORT-FORWARD action, daemon side.
//!
//! One upgraded connection carries the whole port-forward session; the local
//! client then opens a (`data`, `error`) stream pair per forwarded TCP
//! connection, tagged with `port` and `requestID` headers. Each pair becomes
//! a sub-request with its own id: local bytes flow out as sequenced
//! `kube/portforward/datain` payloads, and `kube/portforward/data` /
//! `kube/portforward/error` stream messages flow back through the same
//! reorder discipline. Closing one pair emits `request/stop`; losing the
//! connection emits `stop`.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kubelink_core::actions::{
    ActionFamily, PortForwardDataInPayload, PortForwardRequestStopPayload, PortForwardStartPayload,
    PortForwardStopPayload, PORTFORWARD_DATA_IN, PORTFORWARD_REQUEST_STOP, PORTFORWARD_START,
    PORTFORWARD_STOP, STREAM_TYPE_PF_DATA, STREAM_TYPE_PF_ERROR, STREAM_TYPE_PF_READY,
};
use kubelink_core::channel::ChannelHandle;
use kubelink_core::message::StreamMessage;
use kubelink_core::registry::InboundMessage;
use kubelink_core::reorder::OrderedQueue;

use crate::spdy::{SpdySession, SpdyStream};

use super::CommandContext;

/// Depth of each sub-connection's inbound queue.
const SUB_QUEUE_DEPTH: usize = 64;

/// Upgrade the request and run the port-forward session on the upgraded
/// connection. Port-forward clients bring their own subprotocol names, so
/// the offered value (if any) is echoed back.
pub fn handle(channel: ChannelHandle, meta: CommandContext, mut req: Request) -> Response {
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("connection does not support upgrade"))
            .unwrap_or_default();
    };
    let offered = req
        .headers()
        .get(crate::spdy::STREAM_PROTOCOL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let endpoint = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), ToString::to_string);
    info!(%endpoint, "port-forward upgrade accepted");

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("port-forward upgrade failed: {e}");
                return;
            }
        };
        let session = SpdySession::new(TokioIo::new(upgraded), false);
        run_session(channel, meta, endpoint, session).await;
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "SPDY/3.1");
    if let Some(offered) = offered {
        if let Some(first) = offered.split(',').next() {
            builder = builder.header(crate::spdy::STREAM_PROTOCOL_HEADER, first.trim());
        }
    }
    builder.body(Body::empty()).unwrap_or_default()
}

/// Drive one port-forward session over an established stream session.
pub async fn run_session(
    channel: ChannelHandle,
    meta: CommandContext,
    endpoint: String,
    mut session: SpdySession,
) {
    let request_id = Uuid::new_v4().to_string();
    let mut rx = match channel
        .register(&request_id, ActionFamily::PortForward)
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            warn!("port-forward register failed: {e}");
            return;
        }
    };

    if channel
        .send_action(PORTFORWARD_START, &PortForwardStartPayload {
            request_id: request_id.clone(),
            log_id: meta.log_id.clone(),
            kube_command: meta.kube_command.clone(),
            endpoint,
        })
        .await
        .is_err()
    {
        channel.remove(&request_id).await;
        return;
    }

    // Stream pairs arrive keyed by the client's requestID header; a pair
    // becomes a live sub-connection once both halves exist.
    let mut pending: HashMap<String, PartialPair> = HashMap::new();
    let mut subs: HashMap<String, mpsc::Sender<StreamMessage>> = HashMap::new();
    let mut closed = session.closed();
    let mut cancel = channel.cancelled();

    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = closed.changed() => {
                debug!(%request_id, "local port-forward connection closed");
                break;
            }
            accepted = session.accept() => {
                let Some(stream) = accepted else { break };
                if let Some((sub_id, tx)) =
                    stage_stream(&mut pending, stream, &channel, &request_id)
                {
                    subs.insert(sub_id, tx);
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    InboundMessage::Stream(stream) => {
                        let Some(sub_id) = stream.port_forward_request_id.clone() else {
                            warn!(%request_id, "stream chunk without sub-request id");
                            continue;
                        };
                        match subs.get(&sub_id) {
                            Some(tx) => {
                                if tx.send(stream).await.is_err() {
                                    subs.remove(&sub_id);
                                }
                            }
                            None => debug!(%sub_id, "chunk for finished sub-connection"),
                        }
                    }
                    InboundMessage::Error(error) => {
                        warn!(%request_id, "port-forward failed upstream: {}", error.message);
                        break;
                    }
                    InboundMessage::Request { action, .. } => {
                        warn!(%request_id, %action, "unexpected request-bearing message");
                    }
                }
            }
        }
    }

    drop(subs); // ends every sub task's inbound queue
    let _ = channel
        .send_action(PORTFORWARD_STOP, &PortForwardStopPayload {
            request_id: request_id.clone(),
            log_id: meta.log_id,
        })
        .await;
    channel.remove(&request_id).await;
}

/// One forwarded connection's streams while its halves trickle in.
#[derive(Default)]
struct PartialPair {
    data: Option<SpdyStream>,
    error: Option<SpdyStream>,
    port: u16,
}

/// A confirmed (data, error) pair, only ever built from a complete
/// [`PartialPair`].
struct StreamPair {
    data: SpdyStream,
    error: SpdyStream,
    port: u16,
}

/// File a newly accepted stream into its pair; spawn the sub-connection when
/// both halves are present. Returns the sub id and inbound sender to index.
fn stage_stream(
    pending: &mut HashMap<String, PartialPair>,
    stream: SpdyStream,
    channel: &ChannelHandle,
    request_id: &str,
) -> Option<(String, mpsc::Sender<StreamMessage>)> {
    let pair_key = stream
        .headers
        .get("requestID")
        .unwrap_or_default()
        .to_string();
    let port: u16 = stream
        .headers
        .get("port")
        .and_then(|p| p.parse().ok())
        .unwrap_or_default();

    let entry = pending.entry(pair_key.clone()).or_default();
    if port != 0 {
        entry.port = port;
    }
    match stream.stream_type.as_str() {
        "data" => entry.data = Some(stream),
        "error" => entry.error = Some(stream),
        other => {
            warn!(stream_type = other, "unexpected port-forward stream type");
            return None;
        }
    }
    if entry.data.is_none() || entry.error.is_none() {
        return None;
    }

    let staged = pending.remove(&pair_key)?;
    let (Some(data), Some(error)) = (staged.data, staged.error) else {
        return None;
    };
    let pair = StreamPair {
        data,
        error,
        port: staged.port,
    };

    let sub_id = Uuid::new_v4().to_string();
    let (tx, sub_rx) = mpsc::channel(SUB_QUEUE_DEPTH);
    debug!(%sub_id, port = pair.port, "port-forward sub-connection open");
    tokio::spawn(run_sub_connection(
        channel.clone(),
        request_id.to_string(),
        sub_id.clone(),
        pair,
        sub_rx,
    ));
    Some((sub_id, tx))
}

/// Pump one forwarded TCP connection in both directions.
async fn run_sub_connection(
    channel: ChannelHandle,
    request_id: String,
    sub_id: String,
    pair: StreamPair,
    mut inbound: mpsc::Receiver<StreamMessage>,
) {
    let StreamPair {
        data: mut data_stream,
        error: error_stream,
        port,
    } = pair;

    // Opening payload: sequence 0 with no data tells the agent to dial the
    // pod port before any bytes flow.
    let mut out_seq = 0_u64;
    debug!("DEBUGMARK before send_data_in");
    if send_data_in(&channel, &request_id, &sub_id, port, &mut out_seq, Vec::new())
        .await
        .is_err()
    {
        debug!("DEBUGMARK send_data_in errored");
        return;
    }
    debug!("DEBUGMARK after send_data_in");

    let mut data_queue: OrderedQueue<Vec<u8>> = OrderedQueue::default();
    let mut error_queue: OrderedQueue<Vec<u8>> = OrderedQueue::default();
    let mut cancel = channel.cancelled();

    loop {
        tokio::select! {
            _ = cancel.changed() => return,

            chunk = data_stream.read() => {
                match chunk {
                    Some(chunk) => {
                        if send_data_in(&channel, &request_id, &sub_id, port, &mut out_seq, chunk)
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    None => {
                        // Local side closed this connection: stop just this
                        // sub-stream, the session stays up.
                        let _ = channel
                            .send_action(PORTFORWARD_REQUEST_STOP, &PortForwardRequestStopPayload {
                                request_id: request_id.clone(),
                                port_forward_request_id: sub_id.clone(),
                            })
                            .await;
                        return;
                    }
                }
            }

            msg = inbound.recv() => {
                let Some(msg) = msg else { return };
                let Ok(content) = msg.content_bytes() else {
                    warn!(%sub_id, "dropping chunk with bad base64");
                    continue;
                };
                let last = !msg.more;
                match msg.stream_type.as_str() {
                    STREAM_TYPE_PF_READY => {
                        debug!(%sub_id, "remote socket open");
                    }
                    STREAM_TYPE_PF_DATA => {
                        let seq = msg.sequence_number;
                        let ready = match data_queue.push(seq, content) {
                            Ok(ready) => ready,
                            Err(e) => {
                                warn!(%sub_id, "data reorder overflow: {e}");
                                return;
                            }
                        };
                        for chunk in ready {
                            if !chunk.is_empty() && data_stream.write(&chunk).await.is_err() {
                                return;
                            }
                        }
                        if last {
                            data_stream.close().await;
                            return;
                        }
                    }
                    STREAM_TYPE_PF_ERROR => {
                        let ready = match error_queue.push(msg.sequence_number, content) {
                            Ok(ready) => ready,
                            Err(_) => return,
                        };
                        for chunk in ready {
                            if !chunk.is_empty() && error_stream.write(&chunk).await.is_err() {
                                return;
                            }
                        }
                    }
                    other => warn!(%sub_id, stream_type = other, "unexpected stream type"),
                }
            }
        }
    }
}

async fn send_data_in(
    channel: &ChannelHandle,
    request_id: &str,
    sub_id: &str,
    port: u16,
    seq: &mut u64,
    data: Vec<u8>,
) -> Result<(), kubelink_core::error::TransportError> {
    let payload = PortForwardDataInPayload {
        request_id: request_id.to_string(),
        port_forward_request_id: sub_id.to_string(),
        sequence_number: *seq,
        port,
        data,
    };
    *seq += 1;
    channel.send_action(PORTFORWARD_DATA_IN, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelink_core::channel::{self, SessionChannels};
    use kubelink_core::message::{ActionMessage, AgentMessage};
    use kubelink_core::registry::ActionRegistry;
    use tokio::sync::watch;

    struct Harness {
        registry: ActionRegistry,
        channel: ChannelHandle,
        outbound_rx: mpsc::Receiver<AgentMessage>,
        _cancel_tx: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let registry = ActionRegistry::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let SessionChannels {
            handle,
            outbound_rx,
            ..
        } = channel::session(registry.clone(), cancel_rx);
        Harness {
            registry,
            channel: handle,
            outbound_rx,
            _cancel_tx: cancel_tx,
        }
    }

    async fn next_action(outbound_rx: &mut mpsc::Receiver<AgentMessage>) -> ActionMessage {
        outbound_rx
            .recv()
            .await
            .expect("outbound envelope")
            .payload()
            .unwrap()
    }

    fn pair_headers(stream_type: &str, port: u16, pair: &str) -> HashMap<String, String> {
        HashMap::from([
            ("streamType".to_string(), stream_type.to_string()),
            ("port".to_string(), port.to_string()),
            ("requestID".to_string(), pair.to_string()),
        ])
    }

    #[tokio::test]
    async fn forwards_one_connection_both_ways() {
        let _ = tracing_subscriber::fmt().with_env_filter("trace").try_init();
        let mut h = harness();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = SpdySession::new(client_io, true);
        let server = SpdySession::new(server_io, false);

        let session = tokio::spawn(run_session(
            h.channel.clone(),
            CommandContext::default(),
            "/api/v1/namespaces/default/pods/p/portforward".to_string(),
            server,
        ));

        let start = next_action(&mut h.outbound_rx).await;
        assert_eq!(start.action, PORTFORWARD_START);
        let start: PortForwardStartPayload = start.payload().unwrap();
        let request_id = start.request_id.clone();

        // one forwarded connection: error stream first, then data
        let error_stream = client
            .open(&pair_headers("error", 8080, "0"))
            .await
            .unwrap();
        let mut data = client.open(&pair_headers("data", 8080, "0")).await.unwrap();

        // opening datain (seq 0, empty) announces the sub-connection
        let open = next_action(&mut h.outbound_rx).await;
        assert_eq!(open.action, PORTFORWARD_DATA_IN);
        let open: PortForwardDataInPayload = open.payload().unwrap();
        assert_eq!(open.sequence_number, 0);
        assert_eq!(open.port, 8080);
        assert!(open.data.is_empty());
        let sub_id = open.port_forward_request_id.clone();

        // local bytes become sequenced datain payloads
        data.write(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let sent = next_action(&mut h.outbound_rx).await;
        let sent: PortForwardDataInPayload = sent.payload().unwrap();
        assert_eq!(sent.sequence_number, 1);
        assert_eq!(sent.data, b"GET / HTTP/1.0\r\n\r\n");

        // remote bytes come back out of order and are reordered locally
        let chunk = |seq: u64, content: &[u8]| {
            InboundMessage::Stream(
                StreamMessage::new(&request_id, STREAM_TYPE_PF_DATA, seq, content)
                    .for_sub_request(&sub_id),
            )
        };
        h.registry
            .deliver(&request_id, chunk(1, b" world"))
            .await
            .unwrap();
        h.registry
            .deliver(&request_id, chunk(0, b"hello"))
            .await
            .unwrap();

        assert_eq!(data.read().await.unwrap(), b"hello");
        assert_eq!(data.read().await.unwrap(), b" world");

        // closing the local data stream stops only the sub-connection
        data.close().await;
        drop(data);
        let stop = next_action(&mut h.outbound_rx).await;
        assert_eq!(stop.action, PORTFORWARD_REQUEST_STOP);
        let stop: PortForwardRequestStopPayload = stop.payload().unwrap();
        assert_eq!(stop.port_forward_request_id, sub_id);

        // dropping the whole client connection tears the session down
        drop(error_stream);
        drop(client);
        let stop = next_action(&mut h.outbound_rx).await;
        assert_eq!(stop.action, PORTFORWARD_STOP);

        session.await.unwrap();
        assert!(h.registry.is_empty().await);
    }
}
