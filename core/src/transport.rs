//! Persistent framed transport to the relay.
//!
//! ## Connection lifecycle
//!
//! 1. **Negotiate** — HTTP POST to `<serviceUrl><hub>/negotiate` with
//!    `clientProtocol=1.5` and all session params as query. A 401 is a
//!    permanent auth failure; any other non-200 sleeps the retry interval
//!    and tries again.
//! 2. **Challenge** (optional, control plane only) — fetch a nonce from the
//!    challenge endpoint, sign it and the agent version with the vault key,
//!    and attach both as params before negotiating.
//! 3. **Dial + handshake** — open the websocket and immediately write
//!    `{"protocol":"json","version":1}` followed by the `0x1E` record
//!    separator.
//! 4. **Subscribe** — outbound sending is gated until the relay signals
//!    readiness with a `ReadyBastionToClient` record (or any first
//!    invocation record).
//!
//! ## I/O discipline
//!
//! The transport owns the socket. One task runs the connection: it reads
//! frames, splits them on `0x1E`, and fans invocation records into the
//! `inbound` queue; outbound envelopes drain from a single bounded queue so
//! record bytes can never interleave. Target hub names are resolved at
//! enqueue time by the caller-supplied selector; an envelope with no mapping
//! fails with `NoRoute` before anything touches the socket.
//!
//! ## Reconnect
//!
//! On a read error: a clean close (or `auto_reconnect == false`) surfaces
//! the `done` signal; otherwise negotiation and handshake are redone with a
//! fixed backoff, indefinitely. Envelopes enqueued during the outage are
//! held in order; a record that failed mid-send is retried first after
//! reconnect.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::TransportError;
use crate::message::{
    AgentMessage, GetChallengeMessage, GetChallengeResponse, NegotiateResponse, SignalRMessage,
    INVOCATION_TYPE, RECORD_SEPARATOR, TARGET_CLOSE, TARGET_READY,
};
use crate::vault::Vault;

/// Depth of the inbound and outbound envelope queues.
pub const QUEUE_DEPTH: usize = 200;

/// Default sleep between failed connection attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Relay endpoint that serves challenge nonces.
pub const CHALLENGE_ENDPOINT: &str = "/api/v1/kube/get-challenge";

const HANDSHAKE: &str = r#"{"protocol":"json","version":1}"#;

/// Maps an outbound envelope to its hub target. `None` means the kind has no
/// route on this plane.
pub type TargetSelect = Arc<dyn Fn(&AgentMessage) -> Option<&'static str> + Send + Sync>;

/// Challenge-auth settings for a transport that must prove its identity.
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    pub vault_path: PathBuf,
    pub org_id: String,
    pub cluster_name: String,
    pub agent_version: String,
}

/// Everything needed to establish (and re-establish) the channel.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay base URL including scheme, e.g. `https://relay.example.com`.
    pub service_url: Url,
    /// Hub path, e.g. `/api/v1/hub/kube-server`.
    pub hub: String,
    pub params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub auto_reconnect: bool,
    pub challenge: Option<ChallengeConfig>,
    pub retry_interval: Duration,
}

impl TransportConfig {
    pub fn new(service_url: Url, hub: &str) -> Self {
        Self {
            service_url,
            hub: hub.to_string(),
            params: HashMap::new(),
            headers: HashMap::new(),
            auto_reconnect: false,
            challenge: None,
            retry_interval: RETRY_INTERVAL,
        }
    }
}

/// Cloneable sending/liveness half of a running transport.
#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<(String, AgentMessage)>,
    select: TargetSelect,
    done: watch::Receiver<bool>,
    /// Keeps a detached handle's `done` channel open (see [`Self::detached`]).
    done_guard: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl TransportHandle {
    /// Resolve the hub target and enqueue the envelope. FIFO order of
    /// enqueued envelopes is preserved across reconnects.
    pub async fn send(&self, msg: AgentMessage) -> Result<(), TransportError> {
        let target = (self.select)(&msg).ok_or(TransportError::NoRoute(msg.message_type))?;
        self.outbound
            .send((target.to_string(), msg))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Watch that flips to `true` when the transport has permanently ended.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// A handle with no socket behind it: enqueued envelopes land on the
    /// returned receiver. Used by in-process harnesses.
    pub fn detached(select: TargetSelect) -> (Self, mpsc::Receiver<(String, AgentMessage)>) {
        let (outbound, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (done_tx, done) = watch::channel(false);
        (
            Self {
                outbound,
                select,
                done,
                done_guard: Some(std::sync::Arc::new(done_tx)),
            },
            outbound_rx,
        )
    }
}

/// A running transport: the inbound envelope queue plus its handle.
pub struct Transport {
    pub inbound: mpsc::Receiver<AgentMessage>,
    pub handle: TransportHandle,
}

impl Transport {
    /// Spawn the connection supervisor and return the running transport.
    /// `shutdown` flipping to `true` stops it; pending outbound is dropped.
    pub fn start(
        config: TransportConfig,
        select: TargetSelect,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(supervise(config, outbound_rx, inbound_tx, done_tx, shutdown));

        Self {
            inbound: inbound_rx,
            handle: TransportHandle {
                outbound: outbound_tx,
                select,
                done: done_rx,
                done_guard: None,
            },
        }
    }
}

enum ConnectError {
    /// Do not retry: auth was rejected or the identity key is unusable.
    Permanent(TransportError),
    /// Sleep and retry.
    Transient(TransportError),
}

enum ConnOutcome {
    Reconnect,
    Done,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn supervise(
    mut config: TransportConfig,
    mut outbound_rx: mpsc::Receiver<(String, AgentMessage)>,
    inbound_tx: mpsc::Sender<AgentMessage>,
    done_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let http = reqwest::Client::new();
    // A record that failed mid-send, retried first after reconnect.
    let mut unsent: Option<String> = None;

    'outer: loop {
        let socket = loop {
            let attempt = tokio::select! {
                r = connect_once(&http, &mut config) => r,
                _ = shutdown.changed() => break 'outer,
            };
            match attempt {
                Ok(socket) => break socket,
                Err(ConnectError::Permanent(e)) => {
                    error!("connection failed permanently: {e}");
                    break 'outer;
                }
                Err(ConnectError::Transient(e)) => {
                    warn!(
                        "connection failed: {e}; retrying in {:?}",
                        config.retry_interval
                    );
                    tokio::select! {
                        () = tokio::time::sleep(config.retry_interval) => {}
                        _ = shutdown.changed() => break 'outer,
                    }
                }
            }
        };

        info!(hub = %config.hub, "transport connected");
        let outcome = run_connection(
            socket,
            &mut outbound_rx,
            &inbound_tx,
            &mut unsent,
            config.auto_reconnect,
            &mut shutdown,
        )
        .await;

        match outcome {
            ConnOutcome::Done => break,
            ConnOutcome::Reconnect => {
                warn!(hub = %config.hub, "transport lost; reconnecting");
                tokio::select! {
                    () = tokio::time::sleep(config.retry_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    let _ = done_tx.send(true);
}

/// One full connection attempt: challenge (optional), negotiate, dial,
/// handshake.
async fn connect_once(
    http: &reqwest::Client,
    config: &mut TransportConfig,
) -> Result<Socket, ConnectError> {
    if let Some(challenge) = config.challenge.clone() {
        solve_challenge(http, config, &challenge).await?;
    }

    // Negotiate a connection id.
    let base = config.service_url.as_str().trim_end_matches('/');
    let negotiate_url = format!("{base}{}/negotiate", config.hub);
    let response = http
        .post(&negotiate_url)
        .query(&[("clientProtocol", "1.5")])
        .query(&config.params)
        .send()
        .await
        .map_err(|e| ConnectError::Transient(TransportError::NegotiateFailed(e.to_string())))?;

    if response.status().as_u16() == 401 {
        return Err(ConnectError::Permanent(TransportError::AuthFailed));
    }
    if !response.status().is_success() {
        return Err(ConnectError::Transient(TransportError::NegotiateFailed(
            format!("status {}", response.status()),
        )));
    }
    let negotiated: NegotiateResponse = response
        .json()
        .await
        .map_err(|e| ConnectError::Transient(TransportError::NegotiateFailed(e.to_string())))?;

    config
        .params
        .insert("id".to_string(), negotiated.connection_id);
    config
        .params
        .insert("clientProtocol".to_string(), "1.5".to_string());
    config
        .params
        .insert("transport".to_string(), "WebSockets".to_string());

    // Dial the websocket.
    let mut ws_url = config.service_url.clone();
    let ws_scheme = match ws_url.scheme() {
        "http" => "ws",
        _ => "wss",
    };
    ws_url
        .set_scheme(ws_scheme)
        .map_err(|()| ConnectError::Permanent(TransportError::HandshakeFailed(
            "service url has no host".to_string(),
        )))?;
    ws_url.set_path(&config.hub);
    ws_url
        .query_pairs_mut()
        .clear()
        .extend_pairs(config.params.iter());

    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectError::Transient(TransportError::HandshakeFailed(e.to_string())))?;
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConnectError::Permanent(TransportError::HandshakeFailed(e.to_string())))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ConnectError::Permanent(TransportError::HandshakeFailed(e.to_string())))?;
        request.headers_mut().insert(name, value);
    }

    let (mut socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ConnectError::Transient(TransportError::HandshakeFailed(e.to_string())))?;

    // Agree on the record protocol before anything else.
    let mut handshake = HANDSHAKE.to_string();
    handshake.push(RECORD_SEPARATOR as char);
    socket
        .send(Message::text(handshake))
        .await
        .map_err(|e| ConnectError::Transient(TransportError::HandshakeFailed(e.to_string())))?;

    Ok(socket)
}

/// Fetch and sign the challenge nonce, attaching the solution params.
/// Cryptographic failures are permanent; network failures retry.
async fn solve_challenge(
    http: &reqwest::Client,
    config: &mut TransportConfig,
    challenge: &ChallengeConfig,
) -> Result<(), ConnectError> {
    let vault = Vault::load(&challenge.vault_path)
        .map_err(|e| ConnectError::Permanent(TransportError::NegotiateFailed(e.to_string())))?;

    let base = config.service_url.as_str().trim_end_matches('/');
    let response = http
        .post(format!("{base}{CHALLENGE_ENDPOINT}"))
        .json(&GetChallengeMessage {
            org_id: challenge.org_id.clone(),
            cluster_name: challenge.cluster_name.clone(),
        })
        .send()
        .await
        .map_err(|e| ConnectError::Transient(TransportError::NegotiateFailed(e.to_string())))?;
    if !response.status().is_success() {
        return Err(ConnectError::Transient(TransportError::NegotiateFailed(
            format!("challenge status {}", response.status()),
        )));
    }
    let nonce: GetChallengeResponse = response
        .json()
        .await
        .map_err(|e| ConnectError::Transient(TransportError::NegotiateFailed(e.to_string())))?;

    let solved = vault
        .sign(nonce.challenge.as_bytes())
        .map_err(|_| ConnectError::Permanent(TransportError::AuthFailed))?;
    let signed_version = vault
        .sign(challenge.agent_version.as_bytes())
        .map_err(|_| ConnectError::Permanent(TransportError::AuthFailed))?;

    config
        .params
        .insert("solved_challenge".to_string(), solved);
    config
        .params
        .insert("signed_agent_version".to_string(), signed_version);
    Ok(())
}

/// Drive one live connection until it ends. Returns whether to reconnect.
async fn run_connection(
    socket: Socket,
    outbound_rx: &mut mpsc::Receiver<(String, AgentMessage)>,
    inbound_tx: &mpsc::Sender<AgentMessage>,
    unsent: &mut Option<String>,
    auto_reconnect: bool,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnOutcome {
    let (mut sink, mut stream) = socket.split();
    let mut subscribed = false;

    loop {
        // Retry the record that was in flight when the last connection died.
        if subscribed {
            if let Some(record) = unsent.take() {
                if let Err(e) = sink.send(Message::text(record.clone())).await {
                    warn!("resend after reconnect failed: {e}");
                    *unsent = Some(record);
                    return if auto_reconnect {
                        ConnOutcome::Reconnect
                    } else {
                        ConnOutcome::Done
                    };
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return ConnOutcome::Done;
            }

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) => {
                    debug!("peer sent close frame");
                    return ConnOutcome::Done;
                }
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                    if let Some(outcome) =
                        fan_in_records(&msg.into_data(), &mut subscribed, inbound_tx).await
                    {
                        return outcome;
                    }
                }
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(e)) => {
                    warn!("read error: {e}");
                    return if auto_reconnect { ConnOutcome::Reconnect } else { ConnOutcome::Done };
                }
                None => {
                    return if auto_reconnect { ConnOutcome::Reconnect } else { ConnOutcome::Done };
                }
            },

            item = outbound_rx.recv(), if subscribed && unsent.is_none() => {
                let Some((target, envelope)) = item else {
                    // every handle dropped: nothing more will ever be sent
                    return ConnOutcome::Done;
                };
                let record = match encode_record(&target, envelope) {
                    Ok(r) => r,
                    Err(e) => {
                        error!("dropping unencodable envelope: {e}");
                        continue;
                    }
                };
                trace!(%target, "sending record");
                if let Err(e) = sink.send(Message::text(record.clone())).await {
                    warn!("write error: {e}");
                    *unsent = Some(record);
                    return if auto_reconnect { ConnOutcome::Reconnect } else { ConnOutcome::Done };
                }
            }
        }
    }
}

/// Split a websocket frame into records and fan invocation envelopes into
/// the inbound queue. Returns `Some` when the connection must end.
async fn fan_in_records(
    raw: &[u8],
    subscribed: &mut bool,
    inbound_tx: &mpsc::Sender<AgentMessage>,
) -> Option<ConnOutcome> {
    for record in split_records(raw) {
        let wrapped: SignalRMessage = match serde_json::from_slice(record) {
            Ok(w) => w,
            Err(e) => {
                warn!(
                    "dropping malformed record ({e}): {}",
                    String::from_utf8_lossy(record)
                );
                continue;
            }
        };
        if wrapped.message_type != INVOCATION_TYPE {
            trace!(kind = wrapped.message_type, "ignoring non-invocation record");
            continue;
        }
        match wrapped.target.as_str() {
            TARGET_CLOSE => {
                info!("peer closed the hub");
                return Some(ConnOutcome::Done);
            }
            TARGET_READY => {
                debug!("relay ready; outbound unblocked");
                *subscribed = true;
                continue;
            }
            _ => {
                if !*subscribed {
                    *subscribed = true;
                }
            }
        }
        for envelope in wrapped.arguments {
            if inbound_tx.send(envelope).await.is_err() {
                return Some(ConnOutcome::Done);
            }
        }
    }
    None
}

/// Serialize one envelope into a terminated record for the given target.
fn encode_record(target: &str, envelope: AgentMessage) -> serde_json::Result<String> {
    let wrapped = SignalRMessage {
        target: target.to_string(),
        message_type: INVOCATION_TYPE,
        arguments: vec![envelope],
    };
    let mut record = serde_json::to_string(&wrapped)?;
    record.push(RECORD_SEPARATOR as char);
    Ok(record)
}

/// Split frame bytes on the record separator, dropping empty segments
/// (a trailing separator is the normal case).
fn split_records(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    raw.split(|b| *b == RECORD_SEPARATOR)
        .filter(|seg| !seg.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn any_target(_: &AgentMessage) -> Option<&'static str> {
        Some("TestHub")
    }

    fn envelope(tag: &str) -> AgentMessage {
        AgentMessage {
            message_type: MessageType::Stream,
            schema_version: "v1".to_string(),
            message_payload: tag.as_bytes().to_vec(),
        }
    }

    fn ready_record() -> Message {
        let mut rec = serde_json::to_string(&SignalRMessage {
            target: TARGET_READY.to_string(),
            message_type: INVOCATION_TYPE,
            arguments: vec![],
        })
        .unwrap();
        rec.push(RECORD_SEPARATOR as char);
        Message::text(rec)
    }

    /// Answer one negotiate POST on the listener, then hand back the next
    /// connection as an accepted websocket (handshake record consumed).
    async fn negotiate_then_accept(
        listener: &TcpListener,
    ) -> WebSocketStream<tokio::net::TcpStream> {
        // negotiate
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = vec![0_u8; 4096];
        let n = conn.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("POST"));
        let body = r#"{"connectionId":"conn-1"}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        conn.write_all(response.as_bytes()).await.unwrap();
        drop(conn);

        // websocket
        let (conn, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(conn).await.unwrap();
        // protocol handshake record
        let first = ws.next().await.unwrap().unwrap();
        let raw = first.into_data();
        assert!(String::from_utf8_lossy(&raw).contains(r#""protocol""#));
        ws
    }

    fn test_config(addr: std::net::SocketAddr, auto_reconnect: bool) -> TransportConfig {
        let mut config = TransportConfig::new(
            Url::parse(&format!("http://{addr}")).unwrap(),
            "/api/v1/hub/test",
        );
        config.auto_reconnect = auto_reconnect;
        config.retry_interval = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn outbound_waits_for_ready_then_flows_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut ws = negotiate_then_accept(&listener).await;
            // Nothing may arrive before the ready gate.
            tokio::time::sleep(Duration::from_millis(50)).await;
            ws.send(ready_record()).await.unwrap();

            let mut seen = Vec::new();
            for _ in 0..2 {
                let msg = ws.next().await.unwrap().unwrap();
                let raw = msg.into_data();
                let record = split_records(&raw).next().unwrap();
                let wrapped: SignalRMessage = serde_json::from_slice(record).unwrap();
                assert_eq!(wrapped.target, "TestHub");
                seen.push(wrapped.arguments[0].message_payload.clone());
            }
            seen
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Transport::start(
            test_config(addr, false),
            Arc::new(any_target),
            shutdown_rx,
        );
        transport.handle.send(envelope("first")).await.unwrap();
        transport.handle.send(envelope("second")).await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn reconnects_and_delivers_queued_outbound_exactly_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection dies before ever signalling ready.
            let ws = negotiate_then_accept(&listener).await;
            drop(ws);

            // Second connection succeeds.
            let mut ws = negotiate_then_accept(&listener).await;
            ws.send(ready_record()).await.unwrap();
            let mut seen = Vec::new();
            for _ in 0..2 {
                let msg = ws.next().await.unwrap().unwrap();
                let raw = msg.into_data();
                let record = split_records(&raw).next().unwrap();
                let wrapped: SignalRMessage = serde_json::from_slice(record).unwrap();
                seen.push(wrapped.arguments[0].message_payload.clone());
            }
            // No third message follows.
            let extra =
                tokio::time::timeout(Duration::from_millis(100), ws.next()).await;
            assert!(extra.is_err(), "unexpected extra record after the queue drained");
            seen
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport =
            Transport::start(test_config(addr, true), Arc::new(any_target), shutdown_rx);
        transport.handle.send(envelope("one")).await.unwrap();
        transport.handle.send(envelope("two")).await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn auth_rejection_is_permanent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0_u8; 4096];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        // auto_reconnect on: a 401 must still end the transport
        let transport =
            Transport::start(test_config(addr, true), Arc::new(any_target), shutdown_rx);

        let mut done = transport.handle.done();
        tokio::time::timeout(Duration::from_secs(2), done.wait_for(|d| *d))
            .await
            .expect("transport should give up")
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_records_are_dropped_and_the_rest_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut ws = negotiate_then_accept(&listener).await;
            ws.send(ready_record()).await.unwrap();

            // one frame: garbage record + valid invocation record
            let valid = SignalRMessage {
                target: "SomeHub".to_string(),
                message_type: INVOCATION_TYPE,
                arguments: vec![envelope("payload")],
            };
            let mut frame = String::from("this is not json");
            frame.push(RECORD_SEPARATOR as char);
            frame.push_str(&serde_json::to_string(&valid).unwrap());
            frame.push(RECORD_SEPARATOR as char);
            ws.send(Message::text(frame)).await.unwrap();

            // keep the connection open until the test finishes
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut transport =
            Transport::start(test_config(addr, false), Arc::new(any_target), shutdown_rx);

        let received = tokio::time::timeout(Duration::from_secs(2), transport.inbound.recv())
            .await
            .expect("should receive the valid record")
            .unwrap();
        assert_eq!(received.message_payload, b"payload");
    }

    #[tokio::test]
    async fn no_route_fails_before_enqueue() {
        let (handle, mut outbound_rx) = TransportHandle::detached(Arc::new(|_| None));
        let err = handle.send(envelope("x")).await.unwrap_err();
        assert!(matches!(err, TransportError::NoRoute(_)));
        assert!(outbound_rx.try_recv().is_err(), "nothing was enqueued");
    }
}
