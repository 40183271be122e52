//! Control plane: one challenge-authenticated, auto-reconnecting transport
//! that carries health checks and data-session provisioning.
//!
//! A health check updates the vault's cluster name and answers with the
//! cluster's non-system user principals; a `NewDatachannel` message surfaces
//! on the channel the main loop consumes to open data-plane sessions.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use url::Url;

use kubelink_core::message::{
    AgentMessage, AliveCheckMessage, HealthCheckMessage, MessageType, NewDatachannelMessage,
};
use kubelink_core::transport::{ChallengeConfig, Transport, TransportConfig};
use kubelink_core::vault::Vault;

use crate::kube::KubeApi;

/// Hub the control plane lives on.
pub const CONTROL_HUB: &str = "/api/v1/hub/kube-control";

/// Hub target for health-check replies.
pub const TARGET_ALIVE: &str = "AliveCheckClusterToBastion";

/// Outbound hub mapping for the control plane.
pub fn target_select(msg: &AgentMessage) -> Option<&'static str> {
    match msg.message_type {
        MessageType::HealthCheck => Some(TARGET_ALIVE),
        _ => None,
    }
}

/// Identity and addressing for the control transport.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub service_url: Url,
    pub org_id: String,
    pub cluster_name: String,
    pub cluster_id: String,
    pub environment_id: String,
    pub agent_version: String,
    pub vault_path: PathBuf,
}

/// A running control channel.
pub struct ControlChannel {
    /// Data-session provisioning requests from the relay.
    pub new_sessions: mpsc::Receiver<NewDatachannelMessage>,
    /// Flips when the control transport has permanently ended.
    pub done: watch::Receiver<bool>,
}

/// Connect the control transport and spawn its message loop.
pub fn start<K: KubeApi + Clone>(
    kube: K,
    settings: ControlSettings,
    shutdown: watch::Receiver<bool>,
) -> ControlChannel {
    // The vault's cluster name (set by previous health checks) wins over
    // the boot flag once present.
    let (public_key, cluster_name) = match Vault::load(&settings.vault_path) {
        Ok(vault) if !vault.is_empty() => {
            let name = if vault.data.cluster_name.is_empty() {
                settings.cluster_name.clone()
            } else {
                vault.data.cluster_name.clone()
            };
            (vault.data.public_key.clone(), name)
        }
        _ => (String::new(), settings.cluster_name.clone()),
    };

    let mut config = TransportConfig::new(settings.service_url.clone(), CONTROL_HUB);
    config.auto_reconnect = true;
    config.challenge = Some(ChallengeConfig {
        vault_path: settings.vault_path.clone(),
        org_id: settings.org_id.clone(),
        cluster_name: cluster_name.clone(),
        agent_version: settings.agent_version.clone(),
    });
    config.params = HashMap::from([
        ("public_key".to_string(), public_key),
        ("agent_version".to_string(), settings.agent_version.clone()),
        ("org_id".to_string(), settings.org_id.clone()),
        ("cluster_name".to_string(), cluster_name),
        ("cluster_id".to_string(), settings.cluster_id.clone()),
        ("environment_id".to_string(), settings.environment_id.clone()),
    ]);

    let mut transport = Transport::start(config, std::sync::Arc::new(target_select), shutdown.clone());
    let (sessions_tx, sessions_rx) = mpsc::channel(8);
    let done = transport.handle.done();

    tokio::spawn(async move {
        let mut cancel = shutdown;
        let mut done = transport.handle.done();
        loop {
            let envelope = tokio::select! {
                _ = cancel.changed() => break,
                _ = done.changed() => {
                    warn!("control transport ended");
                    break;
                }
                env = transport.inbound.recv() => match env {
                    Some(env) => env,
                    None => break,
                },
            };
            match envelope.message_type {
                MessageType::HealthCheck => {
                    let Ok(probe) = envelope.payload::<HealthCheckMessage>() else {
                        warn!("dropping malformed health check");
                        continue;
                    };
                    let reply = answer_health_check(&kube, &settings.vault_path, probe).await;
                    match AgentMessage::new(MessageType::HealthCheck, &reply) {
                        Ok(reply) => {
                            if let Err(e) = transport.handle.send(reply).await {
                                warn!("health check reply failed: {e}");
                            }
                        }
                        Err(e) => warn!("health check reply encode failed: {e}"),
                    }
                }
                MessageType::NewDatachannel => {
                    match envelope.payload::<NewDatachannelMessage>() {
                        Ok(provision) => {
                            info!(connection_id = %provision.connection_id, "data session requested");
                            if sessions_tx.send(provision).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("dropping malformed provisioning message: {e}"),
                    }
                }
                other => warn!(?other, "unexpected control message"),
            }
        }
    });

    ControlChannel {
        new_sessions: sessions_rx,
        done,
    }
}

/// Persist the relay's view of the cluster name, then report liveness and
/// the enumerable cluster users. Enumeration failure still reports alive.
pub async fn answer_health_check<K: KubeApi>(
    kube: &K,
    vault_path: &std::path::Path,
    probe: HealthCheckMessage,
) -> AliveCheckMessage {
    match Vault::load(vault_path) {
        Ok(mut vault) => {
            if vault.data.cluster_name != probe.cluster_name {
                vault.data.cluster_name = probe.cluster_name.clone();
                if let Err(e) = vault.save() {
                    warn!("vault update failed: {e}");
                }
            }
        }
        Err(e) => warn!("vault unreadable during health check: {e}"),
    }

    let cluster_users = match kube.list_users().await {
        Ok(users) => users,
        Err(e) => {
            warn!("user enumeration failed: {e}");
            Vec::new()
        }
    };
    AliveCheckMessage {
        alive: true,
        cluster_users,
    }
}
