//! SPDY-style stream multiplexer for upgraded exec/port-forward connections.
//!
//! The local client upgrades its HTTP request, then opens any number of
//! named streams over the single upgraded byte pipe. Framing:
//!
//! ```text
//! | kind: u8 | stream id: u32 BE | payload len: u32 BE | payload |
//! ```
//!
//! - `SYN` (1) opens a stream; the payload is a JSON header map that must
//!   include `streamType` (`stdin`, `stdout`, `stderr`, `resize`, `error`,
//!   `data`, plus `port`/`requestID` for port-forward pairs).
//! - `DATA` (0) carries stream bytes.
//! - `CLOSE` (2) half-closes a stream from the sender's side.
//!
//! One writer task owns the write half, so frames never interleave. The
//! reader task fans inbound data into per-stream queues and surfaces new
//! streams on an accept queue. Header blocks are plain JSON; there is no
//! zlib dictionary compression.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace, warn};

/// Exec subprotocols in preference order, highest first.
pub const SUPPORTED_PROTOCOLS: [&str; 4] = [
    "v4.channel.k8s.io",
    "v3.channel.k8s.io",
    "v2.channel.k8s.io",
    "channel.k8s.io",
];

/// Header carrying the client's offered subprotocols.
pub const STREAM_PROTOCOL_HEADER: &str = "x-stream-protocol-version";

/// How long the expected streams may take to arrive after the upgrade.
pub const STREAM_CREATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on one frame's payload; larger writes are chunked.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

const FRAME_DATA: u8 = 0;
const FRAME_SYN: u8 = 1;
const FRAME_CLOSE: u8 = 2;

const HEADER_LEN: usize = 9;

/// Depth of each stream's inbound chunk queue.
const STREAM_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum SpdyError {
    #[error("bad stream headers: {0}")]
    Headers(String),

    #[error("expected {expected} streams, got {got} before the deadline")]
    CreationTimeout { expected: usize, got: usize },

    #[error("connection closed")]
    Closed,
}

/// Pick the highest mutually supported subprotocol from the client's offer.
/// `offered` is the raw header value list (comma separated values allowed).
pub fn negotiate_protocol<'a, I>(offered: I) -> Option<&'static str>
where
    I: IntoIterator<Item = &'a str>,
{
    let offered: Vec<&str> = offered
        .into_iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect();
    SUPPORTED_PROTOCOLS
        .iter()
        .find(|supported| offered.contains(*supported))
        .copied()
}

#[derive(Debug)]
struct Frame {
    kind: u8,
    stream_id: u32,
    payload: Vec<u8>,
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Frame>> {
    let mut head = [0_u8; HEADER_LEN];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let kind = head[0];
    let stream_id = u32::from_be_bytes([head[1], head[2], head[3], head[4]]);
    let len = u32::from_be_bytes([head[5], head[6], head[7], head[8]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame payload of {len} bytes exceeds the cap"),
        ));
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        kind,
        stream_id,
        payload,
    }))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    let mut head = [0_u8; HEADER_LEN];
    head[0] = frame.kind;
    head[1..5].copy_from_slice(&frame.stream_id.to_be_bytes());
    head[5..9].copy_from_slice(&u32::try_from(frame.payload.len()).unwrap_or(0).to_be_bytes());
    writer.write_all(&head).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await
}

/// Headers sent with a SYN frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamHeaders(pub HashMap<String, String>);

impl StreamHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// One multiplexed stream.
#[derive(Debug)]
pub struct SpdyStream {
    pub stream_type: String,
    pub headers: StreamHeaders,
    id: u32,
    incoming: mpsc::Receiver<Vec<u8>>,
    writer: mpsc::Sender<Frame>,
}

impl SpdyStream {
    /// Next inbound chunk; `None` once the peer closed this stream or the
    /// connection died.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    /// Write bytes, chunked to the frame payload cap.
    pub async fn write(&self, data: &[u8]) -> Result<(), SpdyError> {
        for chunk in data.chunks(MAX_FRAME_PAYLOAD.max(1)) {
            self.writer
                .send(Frame {
                    kind: FRAME_DATA,
                    stream_id: self.id,
                    payload: chunk.to_vec(),
                })
                .await
                .map_err(|_| SpdyError::Closed)?;
        }
        Ok(())
    }

    /// Half-close from our side.
    pub async fn close(&self) {
        let _ = self
            .writer
            .send(Frame {
                kind: FRAME_CLOSE,
                stream_id: self.id,
                payload: Vec::new(),
            })
            .await;
    }
}

/// A live multiplexed connection over an upgraded byte pipe.
pub struct SpdySession {
    accept_rx: mpsc::Receiver<SpdyStream>,
    writer: mpsc::Sender<Frame>,
    closed: watch::Receiver<bool>,
    next_id: Arc<AtomicU32>,
    open_streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>>,
}

impl SpdySession {
    /// Start the reader/writer tasks over `io`. The accepting side uses even
    /// stream ids, the initiating side odd ones.
    pub fn new<IO>(io: IO, initiator: bool) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (writer_tx, writer_rx) = mpsc::channel::<Frame>(STREAM_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        let (closed_tx, closed_rx) = watch::channel(false);
        let open_streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_loop(write_half, writer_rx));
        tokio::spawn(read_loop(
            read_half,
            accept_tx,
            writer_tx.clone(),
            Arc::clone(&open_streams),
            closed_tx,
        ));

        Self {
            accept_rx,
            writer: writer_tx,
            closed: closed_rx,
            next_id: Arc::new(AtomicU32::new(if initiator { 1 } else { 2 })),
            open_streams,
        }
    }

    /// Next stream opened by the peer; `None` once the connection is gone.
    pub async fn accept(&mut self) -> Option<SpdyStream> {
        self.accept_rx.recv().await
    }

    /// Accept exactly `expected` streams within `timeout`, keyed by their
    /// `streamType` header.
    pub async fn accept_streams(
        &mut self,
        expected: usize,
        timeout: Duration,
    ) -> Result<HashMap<String, SpdyStream>, SpdyError> {
        let mut streams = HashMap::new();
        let deadline = tokio::time::Instant::now() + timeout;
        while streams.len() < expected {
            let accepted = tokio::time::timeout_at(deadline, self.accept()).await;
            match accepted {
                Ok(Some(stream)) => {
                    streams.insert(stream.stream_type.clone(), stream);
                }
                Ok(None) | Err(_) => {
                    return Err(SpdyError::CreationTimeout {
                        expected,
                        got: streams.len(),
                    });
                }
            }
        }
        Ok(streams)
    }

    /// Open a stream toward the peer with the given headers. `streamType`
    /// is required.
    pub async fn open(
        &self,
        headers: &HashMap<String, String>,
    ) -> Result<SpdyStream, SpdyError> {
        let stream_type = headers
            .get("streamType")
            .cloned()
            .ok_or_else(|| SpdyError::Headers("missing streamType".to_string()))?;
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let payload =
            serde_json::to_vec(headers).map_err(|e| SpdyError::Headers(e.to_string()))?;

        let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        self.open_streams.lock().await.insert(id, data_tx);

        self.writer
            .send(Frame {
                kind: FRAME_SYN,
                stream_id: id,
                payload,
            })
            .await
            .map_err(|_| SpdyError::Closed)?;

        Ok(SpdyStream {
            stream_type,
            headers: StreamHeaders(headers.clone()),
            id,
            incoming: data_rx,
            writer: self.writer.clone(),
        })
    }

    /// Watch that flips to `true` when the underlying connection closes.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("stream write ended: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    accept_tx: mpsc::Sender<SpdyStream>,
    writer_tx: mpsc::Sender<Frame>,
    open_streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>>,
    closed_tx: watch::Sender<bool>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("stream read ended: {e}");
                break;
            }
        };
        match frame.kind {
            FRAME_SYN => {
                let headers: HashMap<String, String> =
                    match serde_json::from_slice(&frame.payload) {
                        Ok(h) => h,
                        Err(e) => {
                            warn!("rejecting stream with bad headers: {e}");
                            continue;
                        }
                    };
                let Some(stream_type) = headers.get("streamType").cloned() else {
                    warn!("rejecting stream without streamType header");
                    continue;
                };
                trace!(id = frame.stream_id, %stream_type, "peer opened stream");
                let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
                open_streams.lock().await.insert(frame.stream_id, data_tx);
                let stream = SpdyStream {
                    stream_type,
                    headers: StreamHeaders(headers),
                    id: frame.stream_id,
                    incoming: data_rx,
                    writer: writer_tx.clone(),
                };
                if accept_tx.send(stream).await.is_err() {
                    break;
                }
            }
            FRAME_DATA => {
                // Clone the sender out so the map lock is not held across
                // the send.
                let tx = open_streams.lock().await.get(&frame.stream_id).cloned();
                match tx {
                    Some(tx) => {
                        if tx.send(frame.payload).await.is_err() {
                            trace!(id = frame.stream_id, "dropping data for closed stream");
                        }
                    }
                    None => trace!(id = frame.stream_id, "data for unknown stream"),
                }
            }
            FRAME_CLOSE => {
                open_streams.lock().await.remove(&frame.stream_id);
            }
            other => warn!(kind = other, "ignoring unknown frame kind"),
        }
    }

    open_streams.lock().await.clear();
    let _ = closed_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(stream_type: &str) -> HashMap<String, String> {
        HashMap::from([("streamType".to_string(), stream_type.to_string())])
    }

    #[test]
    fn picks_the_highest_offered_protocol() {
        assert_eq!(
            negotiate_protocol(["channel.k8s.io", "v4.channel.k8s.io"]),
            Some("v4.channel.k8s.io")
        );
        assert_eq!(
            negotiate_protocol(["v2.channel.k8s.io, channel.k8s.io"]),
            Some("v2.channel.k8s.io")
        );
        assert_eq!(negotiate_protocol(["v9.future.k8s.io"]), None);
        assert_eq!(negotiate_protocol([]), None);
    }

    #[tokio::test]
    async fn streams_carry_data_both_ways() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = SpdySession::new(client_io, true);
        let mut server = SpdySession::new(server_io, false);

        let client_stdin = client.open(&headers("stdin")).await.unwrap();
        let mut server_side = server.accept().await.unwrap();
        assert_eq!(server_side.stream_type, "stdin");

        client_stdin.write(b"hello").await.unwrap();
        assert_eq!(server_side.read().await.unwrap(), b"hello");

        server_side.write(b"world").await.unwrap();
        let mut client_stdin = client_stdin;
        assert_eq!(client_stdin.read().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn accept_streams_collects_by_stream_type() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = SpdySession::new(client_io, true);
        let mut server = SpdySession::new(server_io, false);

        for name in ["error", "stdin", "stdout", "stderr", "resize"] {
            client.open(&headers(name)).await.unwrap();
        }
        let streams = server
            .accept_streams(5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(streams.len(), 5);
        assert!(streams.contains_key("stdin"));
        assert!(streams.contains_key("resize"));
    }

    #[tokio::test]
    async fn too_few_streams_times_out() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = SpdySession::new(client_io, true);
        let mut server = SpdySession::new(server_io, false);

        client.open(&headers("stdin")).await.unwrap();
        let err = server
            .accept_streams(3, Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            SpdyError::CreationTimeout { expected, got } => {
                assert_eq!(expected, 3);
                assert_eq!(got, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn close_frame_ends_the_peer_read_side() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = SpdySession::new(client_io, true);
        let mut server = SpdySession::new(server_io, false);

        let client_stream = client.open(&headers("stdin")).await.unwrap();
        let mut server_stream = server.accept().await.unwrap();

        client_stream.write(b"last").await.unwrap();
        client_stream.close().await;

        assert_eq!(server_stream.read().await.unwrap(), b"last");
        assert!(server_stream.read().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_peer_flips_closed() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = SpdySession::new(client_io, true);
        let server = SpdySession::new(server_io, false);

        let mut closed = server.closed();
        drop(client);
        tokio::time::timeout(Duration::from_secs(1), closed.wait_for(|c| *c))
            .await
            .expect("closed should flip")
            .unwrap();
    }

    #[tokio::test]
    async fn large_writes_are_chunked_and_reassembled() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let client = SpdySession::new(client_io, true);
        let mut server = SpdySession::new(server_io, false);

        let stream = client.open(&headers("stdin")).await.unwrap();
        let big = vec![0xAB_u8; MAX_FRAME_PAYLOAD + 17];
        let writer = tokio::spawn(async move {
            stream.write(&big).await.unwrap();
            stream
        });

        let mut server_stream = server.accept().await.unwrap();
        let mut got = Vec::new();
        while got.len() < MAX_FRAME_PAYLOAD + 17 {
            got.extend(server_stream.read().await.unwrap());
        }
        assert_eq!(got.len(), MAX_FRAME_PAYLOAD + 17);
        assert!(got.iter().all(|b| *b == 0xAB));
        writer.await.unwrap();
    }
}
