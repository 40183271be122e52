#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # kubelink-agent
//!
//! In-cluster side of the kubelink split-plane proxy. Registers itself with
//! the relay on first run, keeps one control channel open for health checks
//! and session provisioning, and serves each provisioned data-plane session
//! against the local API server with its service-account credential.
//!
//! ```text
//! main.rs         — flags/env, registration, control loop, shutdown
//! control.rs      — control channel: health checks, NewDatachannel
//! datachannel.rs  — data-plane session: router, action factory, targets
//! kube.rs         — kube adapter: REST, exec, port-forward, user listing
//! actions/
//!   restapi.rs    — unary request/response against kube-apiserver
//!   exec.rs       — remote process streams with tty resize
//!   portforward.rs— pod port connections per sub-request
//!   stream.rs     — watch/follow streaming bodies
//! ```

mod actions;
mod control;
mod datachannel;
mod kube;

use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::Url;

use kubelink_core::vault::Vault;

use kube::InClusterKube;

/// Relay endpoint that accepts first-run agent registration.
const REGISTER_ENDPOINT: &str = "/api/v1/kube/register-agent";

/// In-cluster agent for the kubelink proxy.
#[derive(Parser, Debug)]
#[command(name = "kubelink-agent", version)]
struct Cli {
    /// Relay base URL including scheme.
    #[arg(long, env = "SERVICE_URL")]
    service_url: Option<String>,

    /// Organization this cluster belongs to.
    #[arg(long, env = "ORG_ID")]
    org_id: Option<String>,

    /// Display name of this cluster.
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Relay-assigned cluster id.
    #[arg(long, env = "CLUSTER_ID", default_value = "")]
    cluster_id: String,

    /// One-time token authorizing registration.
    #[arg(long, env = "ACTIVATION_TOKEN")]
    activation_token: Option<String>,

    /// Optional environment this cluster is grouped under.
    #[arg(long, env = "ENVIRONMENT", default_value = "")]
    environment_id: String,

    /// Identity provider name recorded in the vault.
    #[arg(long, env = "IDP_PROVIDER", default_value = "")]
    idp_provider: String,

    /// Identity provider org recorded in the vault.
    #[arg(long, env = "IDP_ORG_ID", default_value = "")]
    idp_org_id: String,

    /// Namespace the agent runs in.
    #[arg(long, env = "NAMESPACE", default_value = "")]
    namespace: String,

    /// Path of the identity vault file.
    #[arg(long, env = "KUBELINK_VAULT", default_value = "/var/lib/kubelink/vault.json")]
    vault: PathBuf,
}

/// First-run registration body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterAgentMessage {
    public_key: String,
    activation_code: String,
    agent_version: String,
    org_id: String,
    environment_id: String,
    cluster_name: String,
    cluster_id: String,
}

fn agent_version() -> String {
    if std::env::var("DEV").as_deref() == Ok("true") {
        "1.0".to_string()
    } else {
        env!("CARGO_PKG_VERSION").to_string()
    }
}

#[tokio::main]
async fn main() {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let cli = Cli::parse();

    // Collect every missing required name so the operator fixes them in one
    // pass.
    let mut missing = Vec::new();
    if cli.service_url.is_none() {
        missing.push("serviceUrl");
    }
    if cli.org_id.is_none() {
        missing.push("orgId");
    }
    if cli.cluster_name.is_none() {
        missing.push("clusterName");
    }
    if cli.activation_token.is_none() {
        missing.push("activationToken");
    }
    if !missing.is_empty() {
        error!("missing required configuration: {missing:?}");
        std::process::exit(1);
    }

    let service_url = match Url::parse(cli.service_url.as_deref().unwrap_or_default()) {
        Ok(url) => url,
        Err(e) => {
            error!("bad serviceUrl: {e}");
            std::process::exit(1);
        }
    };
    let version = agent_version();
    info!("kubelink-agent v{version} starting");

    if let Err(e) = register_if_needed(&cli, &service_url, &version).await {
        error!("registration failed: {e}");
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let settings = control::ControlSettings {
        service_url: service_url.clone(),
        org_id: cli.org_id.clone().unwrap_or_default(),
        cluster_name: cli.cluster_name.clone().unwrap_or_default(),
        cluster_id: cli.cluster_id.clone(),
        environment_id: cli.environment_id.clone(),
        agent_version: version,
        vault_path: cli.vault.clone(),
    };

    // The control channel only needs the adapter for user enumeration; data
    // sessions build their own with the session's impersonation identity.
    let control_kube = match InClusterKube::from_cluster_env(String::new(), Vec::new()) {
        Ok(kube) => kube,
        Err(e) => {
            error!("not running in a cluster: {e}");
            std::process::exit(1);
        }
    };

    let mut control = control::start(control_kube, settings, shutdown_rx.clone());
    info!("control channel up; waiting for sessions");

    loop {
        tokio::select! {
            () = wait_for_signal() => {
                info!("shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
            _ = control.done.changed() => {
                error!("control channel ended; exiting");
                let _ = shutdown_tx.send(true);
                std::process::exit(1);
            }
            provision = control.new_sessions.recv() => {
                let Some(provision) = provision else { break };
                let kube = match InClusterKube::from_cluster_env(
                    provision.target_user.clone(),
                    provision.target_groups.clone(),
                ) {
                    Ok(kube) => kube,
                    Err(e) => {
                        warn!("cannot serve session: {e}");
                        continue;
                    }
                };
                tokio::spawn(datachannel::run_session(
                    kube,
                    service_url.clone(),
                    provision,
                    shutdown_rx.clone(),
                ));
            }
        }
    }
    info!("goodbye");
}

/// Generate an identity and register with the relay on first run; later
/// runs reuse the saved vault untouched.
async fn register_if_needed(cli: &Cli, service_url: &Url, version: &str) -> Result<(), String> {
    let mut vault = Vault::load(&cli.vault).map_err(|e| e.to_string())?;
    if !vault.is_empty() {
        info!("found existing identity in {}", vault.path().display());
        return Ok(());
    }

    info!("creating new agent identity");
    let public_key = vault.generate_identity();
    vault.data.org_id = cli.org_id.clone().unwrap_or_default();
    vault.data.service_url = service_url.to_string();
    vault.data.cluster_name = cli.cluster_name.clone().unwrap_or_default();
    vault.data.environment_id = cli.environment_id.clone();
    vault.data.namespace = cli.namespace.clone();
    vault.data.idp_provider = cli.idp_provider.clone();
    vault.data.idp_org_id = cli.idp_org_id.clone();

    let register = RegisterAgentMessage {
        public_key,
        activation_code: cli.activation_token.clone().unwrap_or_default(),
        agent_version: version.to_string(),
        org_id: cli.org_id.clone().unwrap_or_default(),
        environment_id: cli.environment_id.clone(),
        cluster_name: cli.cluster_name.clone().unwrap_or_default(),
        cluster_id: cli.cluster_id.clone(),
    };

    let base = service_url.as_str().trim_end_matches('/');
    let response = reqwest::Client::new()
        .post(format!("{base}{REGISTER_ENDPOINT}"))
        .json(&register)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("relay answered {}", response.status()));
    }

    vault.save().map_err(|e| e.to_string())?;
    info!("registered with the relay");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT");
    }
}
