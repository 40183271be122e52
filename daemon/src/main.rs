#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # kubelink-daemon
//!
//! Local side of the kubelink split-plane proxy. Runs next to the user,
//! exposes an HTTPS endpoint that mimics the Kubernetes API, and tunnels
//! every kubectl operation over one persistent relay channel to the agent
//! inside the target cluster.
//!
//! ```text
//! main.rs         — entry point, config, TLS listener, graceful shutdown
//! config.rs       — TOML + env-var configuration
//! server.rs       — local HTTPS front-end: auth, request classification
//! spdy.rs         — SPDY-style stream mux for upgraded exec/port-forward
//! datachannel.rs  — relay transport, envelope router, outbound targets
//! actions/
//!   restapi.rs    — unary request/response proxying
//!   exec.rs       — bidirectional stdio streams with tty resize
//!   portforward.rs— multiplexed byte streams per TCP connection
//!   stream.rs     — watch/follow long-poll bodies
//! ```

mod actions;
mod config;
mod datachannel;
mod server;
mod spdy;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use config::Config;

/// Local HTTPS proxy for a remote Kubernetes API server.
#[derive(Parser)]
#[command(name = "kubelink-daemon", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kubelink-daemon: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    info!("kubelink-daemon v{} starting", env!("CARGO_PKG_VERSION"));
    info!("relay: {}", config.relay.service_url);

    let tls = match server::tls_config(&config.server.cert_file, &config.server.key_file) {
        Ok(tls) => tls,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let session = match datachannel::open(&config, shutdown_rx.clone()) {
        Ok(session) => session,
        Err(e) => {
            error!("failed to open relay session: {e}");
            std::process::exit(1);
        }
    };

    let state = server::DaemonState {
        session,
        localhost_token: config.server.localhost_token.clone(),
    };
    let app = server::router(state);

    let addr = format!("127.0.0.1:{}", config.server.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!("listening on https://{addr}");

    let serve_task = tokio::spawn(server::serve(app, listener, tls, shutdown_rx));

    wait_for_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = serve_task.await;
    info!("goodbye");
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
