//! Daemon configuration.
//!
//! Resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `KUBELINK_LOCALHOST_TOKEN`,
//!    `KUBELINK_SERVICE_URL`, `KUBELINK_CONNECTION_ID`,
//!    `KUBELINK_SESSION_TOKEN`, `KUBELINK_PORT`
//! 2. **Config file** — path via `--config <path>`, or `kubelink-daemon.toml`
//!    in CWD
//! 3. **Compiled defaults** — see each field below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! port = 8443
//! cert_file = "/etc/kubelink/daemon.crt"
//! key_file = "/etc/kubelink/daemon.key"
//! localhost_token = "your-local-secret"
//!
//! [relay]
//! service_url = "https://relay.example.com"
//! connection_id = "session-connection-id"
//! token = "session-token"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local TLS listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Local port to listen on (default 8443).
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM certificate chain presented to the local client.
    #[serde(default = "default_cert_file")]
    pub cert_file: String,
    /// PEM private key for the certificate.
    #[serde(default = "default_key_file")]
    pub key_file: String,
    /// Shared bearer token expected from the local client.
    #[serde(default)]
    pub localhost_token: String,
}

/// Relay session parameters, handed to the daemon by whatever launched it.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Relay base URL including scheme.
    pub service_url: String,
    /// Connection id of the session this daemon serves.
    #[serde(default)]
    pub connection_id: String,
    /// Per-session token paired with the connection id.
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_port() -> u16 {
    8443
}
fn default_cert_file() -> String {
    "daemon.crt".to_string()
}
fn default_key_file() -> String {
    "daemon.key".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            localhost_token: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults. Missing required values are a fatal startup error.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config: Config = if let Some(p) = path {
            let content =
                std::fs::read_to_string(p).map_err(|e| format!("failed to read {p}: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("failed to parse {p}: {e}"))?
        } else if Path::new("kubelink-daemon.toml").exists() {
            let content = std::fs::read_to_string("kubelink-daemon.toml")
                .map_err(|e| format!("failed to read kubelink-daemon.toml: {e}"))?;
            toml::from_str(&content)
                .map_err(|e| format!("failed to parse kubelink-daemon.toml: {e}"))?
        } else {
            Config {
                server: ServerConfig::default(),
                relay: RelayConfig {
                    service_url: String::new(),
                    connection_id: String::new(),
                    token: String::new(),
                },
                logging: LoggingConfig::default(),
            }
        };

        if let Ok(token) = std::env::var("KUBELINK_LOCALHOST_TOKEN") {
            config.server.localhost_token = token;
        }
        if let Ok(url) = std::env::var("KUBELINK_SERVICE_URL") {
            config.relay.service_url = url;
        }
        if let Ok(id) = std::env::var("KUBELINK_CONNECTION_ID") {
            config.relay.connection_id = id;
        }
        if let Ok(token) = std::env::var("KUBELINK_SESSION_TOKEN") {
            config.relay.token = token;
        }
        if let Ok(port) = std::env::var("KUBELINK_PORT") {
            config.server.port = port
                .parse()
                .map_err(|e| format!("invalid KUBELINK_PORT: {e}"))?;
        }

        let mut missing = Vec::new();
        if config.relay.service_url.is_empty() {
            missing.push("relay.service_url");
        }
        if config.server.localhost_token.is_empty() {
            missing.push("server.localhost_token");
        }
        if missing.is_empty() {
            Ok(config)
        } else {
            Err(format!("missing configuration: {missing:?}"))
        }
    }
}
