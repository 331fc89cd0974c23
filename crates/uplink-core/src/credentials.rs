//! Credential broker with single-flight refresh
//!
//! Credentials are published as versioned snapshots. When an upload is
//! rejected, the caller asks for a refresh quoting the version it used; only
//! the first caller holding a stale version does real work, everyone queued
//! behind it gets the newer snapshot back as soon as the lock frees up.

use crate::error::{Result, UplinkError};
use crate::types::Credentials;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// A set of credentials tagged with a monotonically increasing version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialSnapshot {
    pub version: u64,
    pub credentials: Credentials,
}

/// Somewhere fresh credentials can be obtained from
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Produce a replacement for `stale`, which was just rejected
    async fn fetch(&self, stale: &Credentials) -> Result<Credentials>;
}

// Shadow document layout:
// {"state": {"desired": {"S3": {"AccessKey", "SecretKey", "SessionToken"}},
//            "delta":   {"S3": {"Prefix"}}}}
#[derive(Deserialize)]
struct ShadowDocument {
    state: ShadowState,
}

#[derive(Deserialize)]
struct ShadowState {
    desired: DesiredSection,
    #[serde(default)]
    delta: Option<DeltaSection>,
}

#[derive(Deserialize)]
struct DesiredSection {
    #[serde(rename = "S3")]
    s3: DesiredS3,
}

#[derive(Deserialize)]
struct DesiredS3 {
    #[serde(rename = "AccessKey")]
    access_key: String,
    #[serde(rename = "SecretKey")]
    secret_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
}

#[derive(Deserialize)]
struct DeltaSection {
    #[serde(rename = "S3", default)]
    s3: Option<DeltaS3>,
}

#[derive(Deserialize)]
struct DeltaS3 {
    #[serde(rename = "Prefix", default)]
    prefix: Option<String>,
}

/// Parse the device shadow document
pub fn parse_shadow(content: &str) -> Result<Credentials> {
    let doc: ShadowDocument = serde_json::from_str(content)
        .map_err(|e| UplinkError::Credentials(format!("malformed shadow document: {}", e)))?;
    let s3 = doc.state.desired.s3;
    let prefix = doc
        .state
        .delta
        .and_then(|d| d.s3)
        .and_then(|s| s.prefix)
        .filter(|p| !p.is_empty());

    Ok(Credentials {
        access_key: s3.access_key,
        secret_key: s3.secret_key,
        session_token: s3.session_token,
        prefix,
    })
}

/// Read credentials from the shadow file. Used at startup, where failure is fatal.
pub fn load_shadow_file(path: &Path) -> Result<Credentials> {
    info!("Loading credentials from {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| {
        UplinkError::Credentials(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_shadow(&content)
}

/// Waits for the external provisioning process to rewrite the shadow file,
/// then re-reads it
pub struct ShadowFileSource {
    path: PathBuf,
    settle_delay: Duration,
}

impl ShadowFileSource {
    pub fn new(path: impl Into<PathBuf>, settle_delay: Duration) -> Self {
        Self {
            path: path.into(),
            settle_delay,
        }
    }
}

#[async_trait]
impl CredentialSource for ShadowFileSource {
    async fn fetch(&self, _stale: &Credentials) -> Result<Credentials> {
        debug!(
            "Waiting {:?} for the shadow file to be updated",
            self.settle_delay
        );
        tokio::time::sleep(self.settle_delay).await;

        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            UplinkError::Credentials(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        parse_shadow(&content)
    }
}

#[derive(Deserialize)]
struct SessionTokenOutput {
    #[serde(rename = "Credentials")]
    credentials: SessionTokenCredentials,
}

#[derive(Deserialize)]
struct SessionTokenCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
}

/// Mints a temporary session through the cloud CLI
/// (`<cmd> sts get-session-token --duration-seconds N --output json`)
pub struct SessionTokenSource {
    command: String,
    duration: Duration,
}

impl SessionTokenSource {
    pub fn new(command: impl Into<String>, duration: Duration) -> Self {
        Self {
            command: command.into(),
            duration,
        }
    }
}

#[async_trait]
impl CredentialSource for SessionTokenSource {
    async fn fetch(&self, stale: &Credentials) -> Result<Credentials> {
        let output = Command::new(&self.command)
            .arg("sts")
            .arg("get-session-token")
            .arg("--duration-seconds")
            .arg(self.duration.as_secs().to_string())
            .arg("--output")
            .arg("json")
            .output()
            .await
            .map_err(|e| {
                UplinkError::Credentials(format!("failed to run {}: {}", self.command, e))
            })?;

        if !output.status.success() {
            return Err(UplinkError::Credentials(format!(
                "get-session-token exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let parsed: SessionTokenOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            UplinkError::Credentials(format!("unexpected get-session-token output: {}", e))
        })?;

        Ok(Credentials {
            access_key: parsed.credentials.access_key_id,
            secret_key: parsed.credentials.secret_access_key,
            session_token: parsed.credentials.session_token,
            prefix: stale.prefix.clone(),
        })
    }
}

/// Holder of the current credentials
pub struct CredentialBroker {
    current: watch::Sender<CredentialSnapshot>,
    refresh_lock: Mutex<()>,
    source: Arc<dyn CredentialSource>,
    recovery_cache: PathBuf,
}

impl CredentialBroker {
    pub fn new(
        initial: Credentials,
        source: Arc<dyn CredentialSource>,
        recovery_cache: impl Into<PathBuf>,
    ) -> Self {
        let (current, _) = watch::channel(CredentialSnapshot {
            version: 0,
            credentials: initial,
        });

        Self {
            current,
            refresh_lock: Mutex::new(()),
            source,
            recovery_cache: recovery_cache.into(),
        }
    }

    /// Current snapshot; never waits on a refresh in progress
    pub fn get(&self) -> CredentialSnapshot {
        self.current.borrow().clone()
    }

    /// Refresh credentials that were observed at `observed_version`.
    ///
    /// If someone already rotated past that version, the newer snapshot is
    /// returned without touching the source.
    pub async fn refresh(&self, observed_version: u64) -> Result<CredentialSnapshot> {
        let _guard = self.refresh_lock.lock().await;
        debug!("Acquired the credential refresh lock");

        let current = self.get();
        if current.version > observed_version {
            debug!(
                observed = observed_version,
                current = current.version,
                "Credentials already refreshed by another caller"
            );
            return Ok(current);
        }

        self.write_recovery_cache(&current.credentials).await;

        let mut fresh = self.source.fetch(&current.credentials).await?;
        if fresh.prefix.is_none() {
            fresh.prefix = current.credentials.prefix.clone();
        }

        let snapshot = CredentialSnapshot {
            version: current.version + 1,
            credentials: fresh,
        };
        self.current.send_replace(snapshot.clone());
        info!(version = snapshot.version, "Credentials refreshed");

        Ok(snapshot)
    }

    async fn write_recovery_cache(&self, stale: &Credentials) {
        let result = async {
            if let Some(parent) = self.recovery_cache.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let payload = serde_json::to_vec(stale)?;
            tokio::fs::write(&self.recovery_cache, payload).await?;
            Ok::<_, UplinkError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(
                "Failed to write recovery cache {}: {}",
                self.recovery_cache.display(),
                e
            );
        }
    }
}
