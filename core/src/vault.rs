//! On-disk identity vault.
//!
//! A small JSON key/value file holding the agent's long-lived identity: its
//! ed25519 keypair and the cluster metadata gathered at registration. Created
//! on first run; the health-check handler updates `clusterName` in place.
//! Saves are atomic (temp file in the same directory, then rename) and the
//! vault is held behind a single writer by its owners.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// The persisted fields. All strings; empty means unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultData {
    pub public_key: String,
    pub private_key: String,
    pub org_id: String,
    pub service_url: String,
    pub cluster_name: String,
    pub environment_id: String,
    pub namespace: String,
    pub idp_provider: String,
    pub idp_org_id: String,
}

#[derive(Debug)]
pub struct Vault {
    path: PathBuf,
    pub data: VaultData,
}

impl Vault {
    /// Load the vault at `path`. A missing file yields an empty vault (the
    /// caller decides whether that is acceptable).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VaultData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, data })
    }

    /// True until an identity has been generated and saved.
    pub fn is_empty(&self) -> bool {
        self.data.public_key.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generate a fresh ed25519 identity, returning the base64 public key.
    /// Does not save; callers save after registration succeeds.
    pub fn generate_identity(&mut self) -> String {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        self.data.private_key = B64.encode(signing.to_bytes());
        self.data.public_key = B64.encode(signing.verifying_key().to_bytes());
        self.data.public_key.clone()
    }

    /// Sign arbitrary bytes with the stored key; returns base64.
    pub fn sign(&self, message: &[u8]) -> Result<String, VaultError> {
        let key = self.signing_key()?;
        Ok(B64.encode(key.sign(message).to_bytes()))
    }

    fn signing_key(&self) -> Result<SigningKey, VaultError> {
        if self.data.private_key.is_empty() {
            return Err(VaultError::MissingKey);
        }
        let raw = B64
            .decode(&self.data.private_key)
            .map_err(|e| VaultError::BadKey(e.to_string()))?;
        let seed: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::BadKey(format!("expected 32 bytes, got {}", raw.len())))?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// Atomic save: write a sibling temp file, then rename over the target.
    pub fn save(&self) -> Result<(), VaultError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.data)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
