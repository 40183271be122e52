//! Kubernetes adapter.
//!
//! Agent actions never talk to kube-apiserver directly; they consume the
//! [`KubeApi`] trait. The in-cluster implementation uses the pod's service
//! account: REST calls (and streaming REST bodies) over HTTPS, exec and
//! port-forward over the API server's websocket channels. Every upstream
//! call impersonates the session's target user and groups.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::OnceLock;

use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Path to the mounted service-account credentials.
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Exec channel ids on the kube-apiserver websocket.
const CHANNEL_STDIN: u8 = 0;
const CHANNEL_STDOUT: u8 = 1;
const CHANNEL_STDERR: u8 = 2;
const CHANNEL_ERROR: u8 = 3;
const CHANNEL_RESIZE: u8 = 4;

/// Depth of adapter-side byte queues.
const IO_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("kube http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kube stream: {0}")]
    Stream(String),

    #[error("kube config: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: String,
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub endpoint: String,
    pub command: Vec<String>,
    pub tty: bool,
}

/// Live exec: byte queues wired to the remote process.
pub struct ExecChannels {
    pub stdin: mpsc::Sender<Vec<u8>>,
    pub resize: mpsc::Sender<(u16, u16)>,
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct PortForwardSpec {
    pub endpoint: String,
    pub port: u16,
}

/// Live forwarded connection: a byte queue pair to the pod port.
pub struct PortForwardConn {
    pub write: mpsc::Sender<Vec<u8>>,
    pub read: mpsc::Receiver<Vec<u8>>,
}

/// The operations agent actions consume.
pub trait KubeApi: Send + Sync + 'static {
    fn do_rest(
        &self,
        req: RestRequest,
    ) -> impl Future<Output = Result<RestResponse, KubeError>> + Send;

    /// REST call whose response body streams; chunks arrive on the receiver.
    fn open_rest_stream(
        &self,
        req: RestRequest,
    ) -> impl Future<Output = Result<mpsc::Receiver<Vec<u8>>, KubeError>> + Send;

    fn open_exec(
        &self,
        spec: ExecSpec,
    ) -> impl Future<Output = Result<ExecChannels, KubeError>> + Send;

    fn open_port_forward(
        &self,
        spec: PortForwardSpec,
    ) -> impl Future<Output = Result<PortForwardConn, KubeError>> + Send;

    /// Distinct non-system user principals across all role bindings,
    /// sorted.
    fn list_users(&self) -> impl Future<Output = Result<Vec<String>, KubeError>> + Send;
}

/// `true` for `system:*`-shaped principals (`system:kube-proxy`,
/// `eks:node-manager`, …) which never belong in the reported user list.
pub fn is_system_principal(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new("^[A-Za-z0-9]*:[A-Za-z0-9-]*$").expect("static pattern"))
        .is_match(name)
}

/// Collect `subjects[].name` where `kind == "User"` from a binding list.
pub fn user_subjects(binding_list: &serde_json::Value, into: &mut BTreeSet<String>) {
    let Some(items) = binding_list["items"].as_array() else {
        return;
    };
    for item in items {
        let Some(subjects) = item["subjects"].as_array() else {
            continue;
        };
        for subject in subjects {
            if subject["kind"].as_str() == Some("User") {
                if let Some(name) = subject["name"].as_str() {
                    if !is_system_principal(name) {
                        into.insert(name.to_string());
                    }
                }
            }
        }
    }
}

/// Adapter backed by the pod's in-cluster credentials.
#[derive(Clone)]
pub struct InClusterKube {
    http: reqwest::Client,
    host: String,
    token: String,
    target_user: String,
    target_groups: Vec<String>,
    tls: std::sync::Arc<rustls::ClientConfig>,
}

impl InClusterKube {
    /// Build from the standard in-cluster environment. `target_user` and
    /// `target_groups` come from the session's provisioning message.
    pub fn from_cluster_env(
        target_user: String,
        target_groups: Vec<String>,
    ) -> Result<Self, KubeError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| KubeError::Config("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = format!("{host}:{port}");

        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .map_err(|e| KubeError::Config(format!("service account token: {e}")))?
            .trim()
            .to_string();

        let ca_pem = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .map_err(|e| KubeError::Config(format!("cluster ca: {e}")))?;

        let mut http = reqwest::Client::builder();
        for cert in reqwest::Certificate::from_pem_bundle(&ca_pem)? {
            http = http.add_root_certificate(cert);
        }
        let http = http.build()?;

        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
            let cert = cert.map_err(|e| KubeError::Config(format!("cluster ca: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| KubeError::Config(format!("cluster ca: {e}")))?;
        }
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            http,
            host,
            token,
            target_user,
            target_groups,
            tls: std::sync::Arc::new(tls),
        })
    }

    fn https_url(&self, endpoint: &str) -> String {
        format!("https://{}{}", self.host, endpoint)
    }

    fn wss_url(&self, endpoint: &str) -> String {
        format!("wss://{}{}", self.host, endpoint)
    }

    fn build_rest(&self, req: &RestRequest) -> Result<reqwest::RequestBuilder, KubeError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| KubeError::Config(format!("bad method {}: {e}", req.method)))?;
        let mut builder = self
            .http
            .request(method, self.https_url(&req.endpoint))
            .bearer_auth(&self.token)
            .header("Impersonate-User", &self.target_user);
        for group in &self.target_groups {
            builder = builder.header("Impersonate-Group", group);
        }
        for (name, value) in &req.headers {
            // the caller's credentials and connection headers stay local
            if matches!(
                name.to_ascii_lowercase().as_str(),
                "authorization" | "host" | "connection" | "content-length"
            ) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }
        Ok(builder)
    }

    /// Upstream websocket with auth and impersonation headers attached.
    async fn dial(
        &self,
        endpoint: &str,
        protocol: &str,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        KubeError,
    > {
        let mut request = self
            .wss_url(endpoint)
            .into_client_request()
            .map_err(|e| KubeError::Stream(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|e| KubeError::Stream(e.to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("impersonate-user"),
            HeaderValue::from_str(&self.target_user)
                .map_err(|e| KubeError::Stream(e.to_string()))?,
        );
        for group in &self.target_groups {
            headers.append(
                HeaderName::from_static("impersonate-group"),
                HeaderValue::from_str(group).map_err(|e| KubeError::Stream(e.to_string()))?,
            );
        }
        headers.insert(
            HeaderName::from_static("sec-websocket-protocol"),
            HeaderValue::from_str(protocol).map_err(|e| KubeError::Stream(e.to_string()))?,
        );

        let connector =
            tokio_tungstenite::Connector::Rustls(std::sync::Arc::clone(&self.tls));
        let (socket, _) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            Some(connector),
        )
        .await
        .map_err(|e| KubeError::Stream(e.to_string()))?;
        Ok(socket)
    }
}

impl KubeApi for InClusterKube {
    async fn do_rest(&self, req: RestRequest) -> Result<RestResponse, KubeError> {
        let response = self.build_rest(&req)?.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();
        Ok(RestResponse {
            status,
            headers,
            body,
        })
    }

    async fn open_rest_stream(
        &self,
        req: RestRequest,
    ) -> Result<mpsc::Receiver<Vec<u8>>, KubeError> {
        let response = self.build_rest(&req)?.send().await?;
        let (tx, rx) = mpsc::channel(IO_QUEUE_DEPTH);
        let mut body = response.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => {
                        if tx.send(chunk.to_vec()).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("rest stream ended: {e}");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn open_exec(&self, spec: ExecSpec) -> Result<ExecChannels, KubeError> {
        let socket = self.dial(&spec.endpoint, "v4.channel.k8s.io").await?;
        let (mut sink, mut stream) = socket.split();

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(IO_QUEUE_DEPTH);
        let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(IO_QUEUE_DEPTH);
        let (stdout_tx, stdout_rx) = mpsc::channel(IO_QUEUE_DEPTH);
        let (stderr_tx, stderr_rx) = mpsc::channel(IO_QUEUE_DEPTH);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    chunk = stdin_rx.recv() => match chunk {
                        Some(chunk) => {
                            let mut framed = Vec::with_capacity(chunk.len() + 1);
                            framed.push(CHANNEL_STDIN);
                            framed.extend_from_slice(&chunk);
                            if sink.send(Message::binary(framed)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    size = resize_rx.recv() => {
                        if let Some((width, height)) = size {
                            let mut framed = format!(
                                r#"{{"Width":{width},"Height":{height}}}"#
                            ).into_bytes();
                            framed.insert(0, CHANNEL_RESIZE);
                            if sink.send(Message::binary(framed)).await.is_err() {
                                break;
                            }
                        }
                    }
                    incoming = stream.next() => {
                        let Some(Ok(msg)) = incoming else { break };
                        if msg.is_close() {
                            break;
                        }
                        let data = msg.into_data();
                        let Some((channel, payload)) = data.split_first() else {
                            continue;
                        };
                        let delivered = match *channel {
                            CHANNEL_STDOUT => stdout_tx.send(payload.to_vec()).await.is_ok(),
                            CHANNEL_STDERR => stderr_tx.send(payload.to_vec()).await.is_ok(),
                            CHANNEL_ERROR => {
                                if !payload.is_empty() {
                                    warn!(
                                        "exec error channel: {}",
                                        String::from_utf8_lossy(payload)
                                    );
                                }
                                true
                            }
                            _ => true,
                        };
                        if !delivered {
                            break;
                        }
                    }
                }
            }
        });

        Ok(ExecChannels {
            stdin: stdin_tx,
            resize: resize_tx,
            stdout: stdout_rx,
            stderr: stderr_rx,
        })
    }

    async fn open_port_forward(
        &self,
        spec: PortForwardSpec,
    ) -> Result<PortForwardConn, KubeError> {
        let separator = if spec.endpoint.contains('?') { '&' } else { '?' };
        let endpoint = format!("{}{}ports={}", spec.endpoint, separator, spec.port);
        let socket = self.dial(&endpoint, "portforward.k8s.io").await?;
        let (mut sink, mut stream) = socket.split();

        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(IO_QUEUE_DEPTH);
        let (read_tx, read_rx) = mpsc::channel(IO_QUEUE_DEPTH);

        tokio::spawn(async move {
            // The first frame on each channel starts with a two-byte port
            // echo that is not connection data.
            let mut data_preamble_seen = false;
            loop {
                tokio::select! {
                    chunk = write_rx.recv() => match chunk {
                        Some(chunk) => {
                            let mut framed = Vec::with_capacity(chunk.len() + 1);
                            framed.push(0);
                            framed.extend_from_slice(&chunk);
                            if sink.send(Message::binary(framed)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    incoming = stream.next() => {
                        let Some(Ok(msg)) = incoming else { break };
                        if msg.is_close() {
                            break;
                        }
                        let data = msg.into_data();
                        let Some((channel, mut payload)) = data.split_first() else {
                            continue;
                        };
                        match *channel {
                            0 => {
                                if !data_preamble_seen {
                                    data_preamble_seen = true;
                                    payload = payload.get(2..).unwrap_or(&[]);
                                }
                                if !payload.is_empty()
                                    && read_tx.send(payload.to_vec()).await.is_err()
                                {
                                    break;
                                }
                            }
                            1 => {
                                let text = String::from_utf8_lossy(payload);
                                let text = text.trim_start_matches(char::from(0));
                                if !text.is_empty() {
                                    warn!("port-forward error channel: {text}");
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok(PortForwardConn {
            write: write_tx,
            read: read_rx,
        })
    }

    async fn list_users(&self) -> Result<Vec<String>, KubeError> {
        let mut users = BTreeSet::new();
        for endpoint in [
            "/apis/rbac.authorization.k8s.io/v1/clusterrolebindings",
            "/apis/rbac.authorization.k8s.io/v1/rolebindings",
        ] {
            let bindings: serde_json::Value = self
                .build_rest(&RestRequest {
                    method: "GET".to_string(),
                    endpoint: endpoint.to_string(),
                    headers: HashMap::new(),
                    body: Vec::new(),
                })?
                .send()
                .await?
                .json()
                .await?;
            user_subjects(&bindings, &mut users);
        }
        Ok(users.into_iter().collect())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_principals_are_recognized() {
        assert!(is_system_principal("system:kube-proxy"));
        assert!(is_system_principal("eks:node-manager"));
        assert!(is_system_principal(":"));
        assert!(!is_system_principal("alice@example.com"));
        assert!(!is_system_principal("bob"));
    }

    #[test]
    fn user_subjects_filters_and_deduplicates() {
        let bindings = json!({
            "items": [
                {"subjects": [
                    {"kind": "User", "name": "bob@y"},
                    {"kind": "User", "name": "system:kube-scheduler"},
                    {"kind": "ServiceAccount", "name": "default"},
                ]},
                {"subjects": [
                    {"kind": "User", "name": "alice@x"},
                    {"kind": "User", "name": "bob@y"},
                ]},
                {"roleRef": {"name": "no-subjects"}},
            ]
        });
        let mut users = BTreeSet::new();
        user_subjects(&bindings, &mut users);
        let users: Vec<String> = users.into_iter().collect();
        assert_eq!(users, vec!["alice@x".to_string(), "bob@y".to_string()]);
    }
}
