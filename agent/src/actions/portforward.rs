//! PORT-FORWARD action, agent side.
//!
//! `kube/portforward/start` pins the endpoint; each new sub-request id seen
//! on a `datain` payload dials the pod port through the adapter, announces
//! `kube/portforward/ready`, and wires bytes both ways. Inbound `datain`
//! payloads are reordered by sequence number before they reach the pod
//! socket; outbound bytes go out as sequenced `kube/portforward/data`
//! stream messages. `request/stop` closes one sub-connection; `stop` ends
//! the whole session.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kubelink_core::actions::{
    PortForwardDataInPayload, PortForwardRequestStopPayload, PortForwardStartPayload,
    PORTFORWARD_DATA_IN, PORTFORWARD_ERROR_IN, PORTFORWARD_REQUEST_STOP, PORTFORWARD_START,
    PORTFORWARD_STOP, STREAM_TYPE_PF_DATA, STREAM_TYPE_PF_READY,
};
use kubelink_core::channel::ChannelHandle;
use kubelink_core::message::{ErrorMessage, StreamMessage};
use kubelink_core::registry::InboundMessage;
use kubelink_core::reorder::OrderedQueue;

use crate::kube::{KubeApi, PortForwardSpec};

struct SubConnection {
    write: mpsc::Sender<Vec<u8>>,
    inbound: OrderedQueue<Vec<u8>>,
}

pub async fn run<K: KubeApi + Clone>(
    kube: K,
    channel: ChannelHandle,
    request_id: String,
    mut rx: mpsc::Receiver<InboundMessage>,
) {
    let mut cancel = channel.cancelled();
    let mut endpoint = String::new();
    let mut subs: HashMap<String, SubConnection> = HashMap::new();

    loop {
        let msg = tokio::select! {
            _ = cancel.changed() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let InboundMessage::Request { action, payload } = msg else {
            warn!(%request_id, "port-forward ignoring non-request message");
            continue;
        };
        match action.as_str() {
            PORTFORWARD_START => {
                match serde_json::from_slice::<PortForwardStartPayload>(&payload) {
                    Ok(start) => {
                        info!(%request_id, endpoint = %start.endpoint, "port-forward session open");
                        endpoint = start.endpoint;
                    }
                    Err(e) => warn!(%request_id, "bad port-forward start payload: {e}"),
                }
            }
            PORTFORWARD_DATA_IN => {
                let Ok(data_in) = serde_json::from_slice::<PortForwardDataInPayload>(&payload)
                else {
                    warn!(%request_id, "bad datain payload");
                    continue;
                };
                handle_data_in(&kube, &channel, &request_id, &endpoint, &mut subs, data_in)
                    .await;
            }
            PORTFORWARD_ERROR_IN => {
                // The reverse error direction has no pod-side sink; surfaced
                // for the operator only.
                if let Ok(data_in) =
                    serde_json::from_slice::<PortForwardDataInPayload>(&payload)
                {
                    warn!(
                        %request_id,
                        sub = %data_in.port_forward_request_id,
                        "error from daemon: {}",
                        String::from_utf8_lossy(&data_in.data)
                    );
                }
            }
            PORTFORWARD_REQUEST_STOP => {
                let Ok(stop) =
                    serde_json::from_slice::<PortForwardRequestStopPayload>(&payload)
                else {
                    warn!(%request_id, "bad request/stop payload");
                    continue;
                };
                // Dropping the writer closes the pod-side socket; the rest
                // of the session stays up.
                if subs.remove(&stop.port_forward_request_id).is_some() {
                    debug!(sub = %stop.port_forward_request_id, "sub-connection closed");
                }
            }
            PORTFORWARD_STOP => {
                debug!(%request_id, "port-forward stopped by the daemon");
                break;
            }
            other => warn!(%request_id, action = other, "unknown port-forward verb"),
        }
    }

    subs.clear();
    channel.remove(&request_id).await;
}

/// Apply one `datain` payload: dial on first sight of the sub id, then feed
/// in-order bytes to the pod socket.
async fn handle_data_in<K: KubeApi + Clone>(
    kube: &K,
    channel: &ChannelHandle,
    request_id: &str,
    endpoint: &str,
    subs: &mut HashMap<String, SubConnection>,
    data_in: PortForwardDataInPayload,
) {
    let sub_id = data_in.port_forward_request_id.clone();
    if !subs.contains_key(&sub_id) {
        let conn = match kube
            .open_port_forward(PortForwardSpec {
                endpoint: endpoint.to_string(),
                port: data_in.port,
            })
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%sub_id, port = data_in.port, "pod dial failed: {e}");
                let _ = channel
                    .send_error(ErrorMessage {
                        request_id: request_id.to_string(),
                        message: format!("port-forward to {} failed: {e}", data_in.port),
                    })
                    .await;
                return;
            }
        };
        debug!(%sub_id, port = data_in.port, "pod connection open");

        // Announce the open socket, then pump pod bytes back as sequenced
        // data chunks.
        let ready = StreamMessage::new(request_id, STREAM_TYPE_PF_READY, 0, &[])
            .for_sub_request(&sub_id);
        let _ = channel.send_stream(ready).await;

        tokio::spawn(pump_pod_output(
            conn.read,
            channel.clone(),
            request_id.to_string(),
            sub_id.clone(),
        ));
        subs.insert(sub_id.clone(), SubConnection {
            write: conn.write,
            inbound: OrderedQueue::default(),
        });
    }

    let Some(sub) = subs.get_mut(&sub_id) else {
        return;
    };
    let ready_chunks = match sub.inbound.push(data_in.sequence_number, data_in.data) {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!(%sub_id, "datain reorder overflow: {e}");
            subs.remove(&sub_id);
            return;
        }
    };
    for chunk in ready_chunks {
        if chunk.is_empty() {
            continue; // the opening payload carries no data
        }
        if sub.write.send(chunk).await.is_err() {
            debug!(%sub_id, "pod connection closed while writing");
            subs.remove(&sub_id);
            return;
        }
    }
}

/// Pod-to-daemon direction: sequenced `data` chunks, terminal when the pod
/// closes the socket.
async fn pump_pod_output(
    mut read: mpsc::Receiver<Vec<u8>>,
    channel: ChannelHandle,
    request_id: String,
    sub_id: String,
) {
    let mut seq = 0_u64;
    while let Some(chunk) = read.recv().await {
        let msg = StreamMessage::new(&request_id, STREAM_TYPE_PF_DATA, seq, &chunk)
            .for_sub_request(&sub_id);
        seq += 1;
        if channel.send_stream(msg).await.is_err() {
            return;
        }
    }
    let last = StreamMessage::new(&request_id, STREAM_TYPE_PF_DATA, seq, &[])
        .for_sub_request(&sub_id)
        .last();
    let _ = channel.send_stream(last).await;
}
