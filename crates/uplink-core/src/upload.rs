//! Single-file upload with credential-rotation recovery

use crate::activity::{ActivityLogger, ActivityRecord};
use crate::archive::bundle_name;
use crate::credentials::CredentialBroker;
use crate::routing::BucketRouter;
use crate::store::RemoteStore;
use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum UploadError {
    /// Worth retrying later; the caller's backoff decides when
    #[error("upload failed: {0}")]
    Transient(String),

    /// Credentials kept being rejected after every refresh
    #[error("credentials rejected {attempts} times uploading {path:?}")]
    MaxRetriesReached { path: PathBuf, attempts: u32 },
}

/// Something that can ship one local file
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `file`. `origin` is the path the file was observed at and
    /// decides the destination; it differs from `file` for bundled logs.
    async fn upload(&self, file: &Path, origin: &Path) -> Result<(), UploadError>;
}

/// Object key for `name`, honouring the credential prefix
pub fn object_key(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{}/{}", p.trim_end_matches('/'), name),
        _ => name.to_string(),
    }
}

/// Name `file` is stored under. A bundle keeps the `<stem>.tgz` name of the
/// file it was built from, whatever its staging name.
fn remote_name(file: &Path, origin: &Path) -> Option<String> {
    if file == origin {
        file.file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
    } else {
        bundle_name(origin).ok()
    }
}

/// Ask `file(1)` for the MIME type
pub async fn detect_mime(path: &Path) -> String {
    let output = Command::new("file")
        .arg("--brief")
        .arg("--mime-type")
        .arg(path)
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            let mime = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if mime.is_empty() {
                FALLBACK_MIME.to_string()
            } else {
                mime
            }
        }
        Ok(out) => {
            debug!("file(1) exited with {} for {}", out.status, path.display());
            FALLBACK_MIME.to_string()
        }
        Err(e) => {
            debug!("file(1) unavailable: {}", e);
            FALLBACK_MIME.to_string()
        }
    }
}

pub struct UploadClient {
    store: Arc<dyn RemoteStore>,
    broker: Arc<CredentialBroker>,
    activity: Arc<ActivityLogger>,
    router: BucketRouter,
    auth_attempts: u32,
}

impl UploadClient {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        broker: Arc<CredentialBroker>,
        activity: Arc<ActivityLogger>,
        router: BucketRouter,
        auth_attempts: u32,
    ) -> Self {
        Self {
            store,
            broker,
            activity,
            router,
            auth_attempts: auth_attempts.max(1),
        }
    }
}

#[async_trait]
impl Uploader for UploadClient {
    async fn upload(&self, file: &Path, origin: &Path) -> Result<(), UploadError> {
        let name = remote_name(file, origin).ok_or_else(|| {
            UploadError::Transient(format!("invalid file name: {}", origin.display()))
        })?;
        let destination = self.router.route(origin);

        for attempt in 1..=self.auth_attempts {
            let snapshot = self.broker.get();
            let key = object_key(snapshot.credentials.prefix.as_deref(), &name);

            info!(
                bucket = %destination.bucket,
                key = %key,
                attempt,
                "Uploading {}",
                file.display()
            );

            match self
                .store
                .put(&snapshot, &destination.bucket, &key, file)
                .await
            {
                Ok(()) => {
                    info!(bucket = %destination.bucket, key = %key, "Uploaded {}", file.display());
                    let mime = detect_mime(file).await;
                    self.activity
                        .record(ActivityRecord::upload(
                            name,
                            Some(destination.bucket_type()),
                            mime,
                            Local::now(),
                        ))
                        .await;
                    return Ok(());
                }
                Err(e) if e.is_auth() => {
                    warn!(
                        attempt,
                        version = snapshot.version,
                        "Credentials rejected while uploading {}: {}",
                        file.display(),
                        e
                    );
                    self.activity
                        .record(ActivityRecord::credential_request(Local::now()))
                        .await;

                    if attempt == self.auth_attempts {
                        break;
                    }
                    if let Err(refresh_err) = self.broker.refresh(snapshot.version).await {
                        error!("Credential refresh failed: {}", refresh_err);
                        return Err(UploadError::Transient(format!(
                            "credential refresh failed: {}",
                            refresh_err
                        )));
                    }
                }
                Err(e) => {
                    error!(
                        bucket = %destination.bucket,
                        key = %key,
                        "Error uploading {}: {}",
                        file.display(),
                        e
                    );
                    return Err(UploadError::Transient(e.to_string()));
                }
            }
        }

        error!(
            "Max retry count reached for {}, skipping for now",
            file.display()
        );
        Err(UploadError::MaxRetriesReached {
            path: file.to_path_buf(),
            attempts: self.auth_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialSnapshot, CredentialSource};
    use crate::store::{RemoteObject, StoreError};
    use crate::types::Credentials;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Store that answers puts from a scripted queue, then succeeds
    #[derive(Default)]
    struct ScriptedStore {
        script: Mutex<VecDeque<StoreError>>,
        puts: Mutex<Vec<(u64, String, String)>>,
    }

    impl ScriptedStore {
        fn failing_with(errors: Vec<StoreError>) -> Self {
            Self {
                script: Mutex::new(errors.into()),
                puts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteStore for ScriptedStore {
        async fn put(
            &self,
            credentials: &CredentialSnapshot,
            bucket: &str,
            key: &str,
            _local_path: &Path,
        ) -> Result<(), StoreError> {
            self.puts.lock().unwrap().push((
                credentials.version,
                bucket.to_string(),
                key.to_string(),
            ));
            match self.script.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn list(
            &self,
            _credentials: &CredentialSnapshot,
            _bucket: &str,
        ) -> Result<Vec<RemoteObject>, StoreError> {
            Ok(Vec::new())
        }

        async fn get(
            &self,
            _credentials: &CredentialSnapshot,
            _bucket: &str,
            key: &str,
        ) -> Result<Bytes, StoreError> {
            Err(StoreError::NotFound(key.to_string()))
        }
    }

    struct StaticSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialSource for StaticSource {
        async fn fetch(&self, _stale: &Credentials) -> crate::error::Result<Credentials> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Credentials {
                access_key: "AK-new".to_string(),
                secret_key: "SK-new".to_string(),
                session_token: "ST-new".to_string(),
                prefix: None,
            })
        }
    }

    struct Fixture {
        dir: TempDir,
        file: PathBuf,
        log_dir: PathBuf,
        store: Arc<ScriptedStore>,
        source: Arc<StaticSource>,
        client: UploadClient,
    }

    fn fixture(errors: Vec<StoreError>, prefix: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let texts = dir.path().join("out").join("texts");
        std::fs::create_dir_all(&texts).unwrap();
        let file = texts.join("note.txt");
        std::fs::write(&file, "hello").unwrap();
        let log_dir = dir.path().join("logs");

        let store = Arc::new(ScriptedStore::failing_with(errors));
        let source = Arc::new(StaticSource {
            calls: AtomicUsize::new(0),
        });
        let broker = Arc::new(CredentialBroker::new(
            Credentials {
                access_key: "AK".to_string(),
                secret_key: "SK".to_string(),
                session_token: "ST".to_string(),
                prefix: prefix.map(str::to_string),
            },
            source.clone(),
            dir.path().join("expired_key_cache.json"),
        ));
        let activity = Arc::new(ActivityLogger::new(&log_dir).unwrap());
        let client = UploadClient::new(
            store.clone(),
            broker,
            activity,
            BucketRouter::by_path("t-bucket", "i-bucket", "v-bucket", "fallback"),
            4,
        );

        Fixture {
            dir,
            file,
            log_dir,
            store,
            source,
            client,
        }
    }

    fn activity_kinds(log_dir: &Path) -> Vec<String> {
        let mut kinds = Vec::new();
        for entry in std::fs::read_dir(log_dir).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let value: serde_json::Value =
                    serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
                kinds.push(value["Kind"].as_str().unwrap().to_string());
            }
        }
        kinds.sort();
        kinds
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(None, "a.txt"), "a.txt");
        assert_eq!(object_key(Some(""), "a.txt"), "a.txt");
        assert_eq!(object_key(Some("device-7"), "a.txt"), "device-7/a.txt");
        assert_eq!(object_key(Some("device-7/"), "a.txt"), "device-7/a.txt");
    }

    #[tokio::test]
    async fn test_success_records_upload() {
        let f = fixture(Vec::new(), Some("device-7"));

        f.client.upload(&f.file, &f.file).await.unwrap();

        let puts = f.store.puts.lock().unwrap().clone();
        assert_eq!(
            puts,
            vec![(0, "t-bucket".to_string(), "device-7/note.txt".to_string())]
        );
        assert_eq!(activity_kinds(&f.log_dir), vec!["Upload"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_refreshes_and_retries() {
        let f = fixture(vec![StoreError::Auth("ExpiredToken".to_string())], None);

        f.client.upload(&f.file, &f.file).await.unwrap();

        let versions: Vec<u64> = f.store.puts.lock().unwrap().iter().map(|p| p.0).collect();
        assert_eq!(versions, vec![0, 1]);
        assert_eq!(f.source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(activity_kinds(&f.log_dir), vec!["Request", "Upload"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_auth_failure_is_terminal() {
        let errors = (0..10)
            .map(|_| StoreError::Auth("InvalidToken".to_string()))
            .collect();
        let f = fixture(errors, None);

        let result = f.client.upload(&f.file, &f.file).await;

        assert!(matches!(
            result,
            Err(UploadError::MaxRetriesReached { attempts: 4, .. })
        ));
        assert_eq!(f.store.puts.lock().unwrap().len(), 4);
        assert_eq!(f.source.calls.load(Ordering::SeqCst), 3);
        let kinds = activity_kinds(&f.log_dir);
        assert_eq!(kinds.len(), 4);
        assert!(kinds.iter().all(|k| k == "Request"));
    }

    #[tokio::test]
    async fn test_other_error_is_transient() {
        let f = fixture(vec![StoreError::Other("connection reset".to_string())], None);

        let result = f.client.upload(&f.file, &f.file).await;

        assert!(matches!(result, Err(UploadError::Transient(_))));
        assert_eq!(f.store.puts.lock().unwrap().len(), 1);
        assert_eq!(f.source.calls.load(Ordering::SeqCst), 0);
        assert!(activity_kinds(&f.log_dir).is_empty());
    }

    #[tokio::test]
    async fn test_bundle_named_and_routed_by_origin() {
        let f = fixture(Vec::new(), Some("device-7"));
        let origin = f.file.with_file_name("report.log");
        std::fs::write(&origin, "log").unwrap();
        let bundle = f.dir.path().join("report.Xa91kQ.tgz");
        std::fs::write(&bundle, "zip").unwrap();

        f.client.upload(&bundle, &origin).await.unwrap();

        let puts = f.store.puts.lock().unwrap().clone();
        assert_eq!(puts[0].1, "t-bucket");
        assert_eq!(puts[0].2, "device-7/report.tgz");
    }

    struct UnreachableSource;

    #[async_trait]
    impl CredentialSource for UnreachableSource {
        async fn fetch(&self, _stale: &Credentials) -> crate::error::Result<Credentials> {
            Err(crate::error::UplinkError::Credentials(
                "shadow document unreadable".to_string(),
            ))
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_is_transient() {
        let f = fixture(vec![StoreError::Auth("ExpiredToken".to_string())], None);
        let broker = Arc::new(CredentialBroker::new(
            Credentials {
                access_key: "AK".to_string(),
                secret_key: "SK".to_string(),
                session_token: "ST".to_string(),
                prefix: None,
            },
            Arc::new(UnreachableSource),
            f.dir.path().join("expired_key_cache.json"),
        ));
        let client = UploadClient::new(
            f.store.clone(),
            broker.clone(),
            Arc::new(ActivityLogger::new(&f.log_dir).unwrap()),
            BucketRouter::fixed("fallback"),
            4,
        );

        let result = client.upload(&f.file, &f.file).await;

        match result {
            Err(UploadError::Transient(msg)) => assert!(msg.contains("credential refresh failed")),
            other => panic!("expected a transient error, got {:?}", other),
        }
        assert_eq!(f.store.puts.lock().unwrap().len(), 1);
        assert_eq!(broker.get().version, 0);
        assert_eq!(activity_kinds(&f.log_dir), vec!["Request"]);
    }
}
