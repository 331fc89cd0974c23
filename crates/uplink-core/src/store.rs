//! Remote object store abstraction
//!
//! The pipeline talks to object storage only through [`RemoteStore`]. The
//! production backend is [`S3Store`]; tests plug in in-memory fakes.

use crate::credentials::CredentialSnapshot;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Markers the service puts in the error body when a session token is no
/// longer accepted
const TOKEN_ERROR_MARKERS: &[&str] = &["ExpiredToken", "InvalidToken", "TokenRefreshRequired"];

/// Files larger than one part go up as a multipart upload in parts of this size
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Parts buffered or in flight at once during a multipart upload
const MAX_CONCURRENT_PARTS: usize = 2;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store request failed: {0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_auth(&self) -> bool {
        matches!(self, StoreError::Auth(_))
    }
}

/// Whether an error message reports an expired or invalid session token
pub fn is_token_error(message: &str) -> bool {
    TOKEN_ERROR_MARKERS.iter().any(|m| message.contains(m))
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteObject {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "LastModified")]
    pub last_modified: DateTime<Utc>,
    #[serde(rename = "Size")]
    pub size: u64,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload one local file to `bucket/key`
    async fn put(
        &self,
        credentials: &CredentialSnapshot,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<(), StoreError>;

    async fn list(
        &self,
        credentials: &CredentialSnapshot,
        bucket: &str,
    ) -> Result<Vec<RemoteObject>, StoreError>;

    async fn get(
        &self,
        credentials: &CredentialSnapshot,
        bucket: &str,
        key: &str,
    ) -> Result<Bytes, StoreError>;
}

/// S3 (or S3-compatible) backend
///
/// Clients are cached per bucket and tagged with the credential version they
/// were built from; a refreshed snapshot transparently rebuilds them.
pub struct S3Store {
    region: String,
    endpoint: Option<String>,
    clients: Mutex<HashMap<String, (u64, Arc<AmazonS3>)>>,
}

impl S3Store {
    pub fn new(region: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            region: region.into(),
            endpoint,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(
        &self,
        credentials: &CredentialSnapshot,
        bucket: &str,
    ) -> Result<Arc<AmazonS3>, StoreError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((version, client)) = clients.get(bucket) {
            if *version == credentials.version {
                return Ok(client.clone());
            }
        }

        let creds = &credentials.credentials;
        let mut builder = AmazonS3Builder::new()
            .with_region(self.region.clone())
            .with_bucket_name(bucket)
            .with_access_key_id(creds.access_key.clone())
            .with_secret_access_key(creds.secret_key.clone());
        if !creds.session_token.is_empty() {
            builder = builder.with_token(creds.session_token.clone());
        }
        if let Some(ref endpoint) = self.endpoint {
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let client = Arc::new(
            builder
                .build()
                .map_err(|e| StoreError::Other(format!("invalid S3 configuration: {}", e)))?,
        );
        clients.insert(bucket.to_string(), (credentials.version, client.clone()));
        Ok(client)
    }
}

fn classify(err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { path, .. } => StoreError::NotFound(path),
        other => {
            let message = other.to_string();
            if is_token_error(&message) {
                StoreError::Auth(message)
            } else {
                StoreError::Other(message)
            }
        }
    }
}

/// Upload `local_path` to `location` without holding the whole file in
/// memory. Files up to `part_size` bytes use a single put; larger ones are
/// streamed as a multipart upload, which is aborted if anything fails.
/// Returns the number of bytes sent.
pub async fn put_file(
    store: &dyn ObjectStore,
    location: &ObjectPath,
    local_path: &Path,
    part_size: usize,
) -> Result<u64, StoreError> {
    let mut file = tokio::fs::File::open(local_path).await?;
    let size = file.metadata().await?.len();

    if size <= part_size as u64 {
        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data).await?;
        store
            .put(location, PutPayload::from(Bytes::from(data)))
            .await
            .map_err(classify)?;
        return Ok(size);
    }

    let upload = store.put_multipart(location).await.map_err(classify)?;
    let mut writer = WriteMultipart::new_with_chunk_size(upload, part_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut sent = 0u64;

    loop {
        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    tracing::warn!("Failed to abort multipart upload of {}: {}", location, abort_err);
                }
                return Err(e.into());
            }
        };
        if n == 0 {
            break;
        }
        if let Err(e) = writer.wait_for_capacity(MAX_CONCURRENT_PARTS).await {
            if let Err(abort_err) = writer.abort().await {
                tracing::warn!("Failed to abort multipart upload of {}: {}", location, abort_err);
            }
            return Err(classify(e));
        }
        writer.write(&buf[..n]);
        sent += n as u64;
    }

    writer.finish().await.map_err(classify)?;
    Ok(sent)
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn put(
        &self,
        credentials: &CredentialSnapshot,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<(), StoreError> {
        let client = self.client(credentials, bucket)?;
        let start = std::time::Instant::now();

        let size =
            put_file(client.as_ref(), &ObjectPath::from(key), local_path, PART_SIZE).await?;

        tracing::debug!(
            bucket = %bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_millis() as u64,
            "S3 put completed"
        );
        Ok(())
    }

    async fn list(
        &self,
        credentials: &CredentialSnapshot,
        bucket: &str,
    ) -> Result<Vec<RemoteObject>, StoreError> {
        let client = self.client(credentials, bucket)?;
        let metas: Vec<_> = client.list(None).try_collect().await.map_err(classify)?;

        Ok(metas
            .into_iter()
            .map(|meta| RemoteObject {
                key: meta.location.to_string(),
                last_modified: meta.last_modified,
                size: meta.size as u64,
            })
            .collect())
    }

    async fn get(
        &self,
        credentials: &CredentialSnapshot,
        bucket: &str,
        key: &str,
    ) -> Result<Bytes, StoreError> {
        let client = self.client(credentials, bucket)?;
        let result = client
            .get(&ObjectPath::from(key))
            .await
            .map_err(classify)?;
        result.bytes().await.map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credentials;

    fn snapshot(version: u64) -> CredentialSnapshot {
        CredentialSnapshot {
            version,
            credentials: Credentials {
                access_key: "AKIAEXAMPLE".to_string(),
                secret_key: "secret".to_string(),
                session_token: "token".to_string(),
                prefix: None,
            },
        }
    }

    #[test]
    fn test_token_error_detection() {
        assert!(is_token_error(
            "Client error with status 400: <Code>ExpiredToken</Code>"
        ));
        assert!(is_token_error("The provided token is malformed: InvalidToken"));
        assert!(!is_token_error("connection reset by peer"));
        assert!(!is_token_error("AccessDenied"));
    }

    #[test]
    fn test_client_rebuilt_on_credential_change() {
        let store = S3Store::new("us-east-1", Some("http://127.0.0.1:9000".to_string()));

        let first = store.client(&snapshot(0), "edge-texts").unwrap();
        let again = store.client(&snapshot(0), "edge-texts").unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let rotated = store.client(&snapshot(1), "edge-texts").unwrap();
        assert!(!Arc::ptr_eq(&first, &rotated));

        let other_bucket = store.client(&snapshot(1), "edge-images").unwrap();
        assert!(!Arc::ptr_eq(&rotated, &other_bucket));
    }

    #[tokio::test]
    async fn test_put_file_small_and_multipart() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = object_store::memory::InMemory::new();

        let small = dir.path().join("note.txt");
        std::fs::write(&small, b"hello").unwrap();
        let sent = put_file(&store, &ObjectPath::from("note.txt"), &small, 1024)
            .await
            .unwrap();
        assert_eq!(sent, 5);

        let clip: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let large = dir.path().join("clip.mp4");
        std::fs::write(&large, &clip).unwrap();
        let sent = put_file(&store, &ObjectPath::from("device-7/clip.mp4"), &large, 1024)
            .await
            .unwrap();
        assert_eq!(sent, clip.len() as u64);

        let stored = store
            .get(&ObjectPath::from("device-7/clip.mp4"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&stored[..], &clip[..]);
        let stored = store
            .get(&ObjectPath::from("note.txt"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&stored[..], b"hello");
    }

    #[tokio::test]
    async fn test_put_file_missing_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = object_store::memory::InMemory::new();

        let err = put_file(&store, &ObjectPath::from("gone.txt"), &dir.path().join("gone.txt"), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_not_found_is_not_auth() {
        let err = classify(object_store::Error::NotFound {
            path: "missing.txt".to_string(),
            source: "no such key".into(),
        });
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!err.is_auth());
    }
}
