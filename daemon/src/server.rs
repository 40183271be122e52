//! Local HTTPS front-end mimicking the Kubernetes API.
//!
//! Every request must carry `Authorization: Bearer
//! <localhostToken>[++++<command>++++<logId>]`; the tail rides along so the
//! relay side can attribute traffic to the kubectl invocation that caused
//! it. A failed check answers 500, matching what the local kubectl plugin
//! expects from a broken proxy.
//!
//! Requests are classified by URL and upgrade headers:
//!
//! | Shape                                              | Action       |
//! |----------------------------------------------------|--------------|
//! | `POST …/pods/{…}/exec` + upgrade                   | EXEC         |
//! | `POST …/pods/{…}/portforward` + upgrade            | PORT-FORWARD |
//! | `…?watch=true` or `…/log?…follow=true`             | STREAM       |
//! | any other `/api/*` or `/apis/*`                    | REST         |

use std::io::BufReader;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Router;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::actions::{self, CommandContext};
use crate::datachannel::Session;

/// Separator between the token and the optional command/log-id tail.
pub const TOKEN_SEPARATOR: &str = "++++";

#[derive(Clone)]
pub struct DaemonState {
    pub session: Session,
    pub localhost_token: String,
}

pub fn router(state: DaemonState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Classify and dispatch one local request.
async fn dispatch(State(state): State<DaemonState>, req: Request) -> Response {
    let Some(meta) = authenticate(&state.localhost_token, &req) else {
        warn!(path = %req.uri().path(), "rejecting request with bad local token");
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap_or_default();
    };

    let path = req.uri().path();
    let query = req.uri().query().unwrap_or("");
    let upgrade = wants_upgrade(&req);
    debug!(%path, upgrade, command = %meta.kube_command, "dispatching local request");

    let channel = state.session.handle.clone();
    if upgrade && path.ends_with("/exec") {
        actions::exec::handle(channel, meta, req)
    } else if upgrade && path.ends_with("/portforward") {
        actions::portforward::handle(channel, meta, req)
    } else if is_follow_request(path, query) {
        actions::stream::handle(channel, meta, req).await
    } else if path.starts_with("/api/") || path.starts_with("/apis/") || path == "/api" {
        actions::restapi::handle(channel, meta, req).await
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap_or_default()
    }
}

fn wants_upgrade(req: &Request) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some()
}

fn is_follow_request(path: &str, query: &str) -> bool {
    let has_param = |name: &str| {
        url::form_urlencoded::parse(query.as_bytes())
            .any(|(key, value)| key == name && value == "true")
    };
    has_param("watch") || (path.ends_with("/log") && has_param("follow"))
}

/// Validate the bearer token and parse the `++++command++++logId` tail.
pub fn authenticate(expected_token: &str, req: &Request) -> Option<CommandContext> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let token = header.strip_prefix("Bearer ")?;

    let mut parts = token.split(TOKEN_SEPARATOR);
    let presented = parts.next()?;
    if !constant_time_eq(expected_token.as_bytes(), presented.as_bytes()) {
        return None;
    }
    match (parts.next(), parts.next()) {
        (Some(command), Some(log_id)) if !log_id.is_empty() => Some(CommandContext {
            kube_command: command.to_string(),
            log_id: log_id.to_string(),
        }),
        _ => Some(CommandContext::default()),
    }
}

/// Constant-time byte comparison so response timing does not leak the token.
fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() { provided[i] } else { 0xff };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Load the PEM cert chain and key into a rustls server config.
pub fn tls_config(cert_file: &str, key_file: &str) -> Result<rustls::ServerConfig, String> {
    let cert_reader = std::fs::File::open(cert_file)
        .map_err(|e| format!("failed to open cert {cert_file}: {e}"))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_reader))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("failed to parse cert {cert_file}: {e}"))?;

    let key_reader = std::fs::File::open(key_file)
        .map_err(|e| format!("failed to open key {key_file}: {e}"))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_reader))
        .map_err(|e| format!("failed to parse key {key_file}: {e}"))?
        .ok_or_else(|| format!("no private key found in {key_file}"))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("bad cert/key pair: {e}"))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Accept TLS connections and serve the router until shutdown. Connections
/// are served with upgrades enabled so exec/port-forward can take over the
/// byte stream.
pub async fn serve(
    app: Router,
    listener: TcpListener,
    tls: rustls::ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let acceptor = TlsAcceptor::from(Arc::new(tls));
    info!("local endpoint ready");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(%peer, "tls handshake failed: {e}");
                    return;
                }
            };
            let service = hyper::service::service_fn(move |request| {
                app.clone().oneshot(request)
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .with_upgrades()
                .await
            {
                debug!(%peer, "connection ended: {e}");
            }
        });
    }
    info!("local endpoint stopped");
}
