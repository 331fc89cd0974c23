//! Append-only activity log
//!
//! Every upload and credential request leaves one immutable JSON file in the
//! log directory. Records are written to a staging file first and become
//! visible only through an atomic rename, so a reader scanning the log
//! directory for `activity_*.json` never sees a half-written record.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

/// Subdirectory of the log directory holding in-progress records
pub const STAGING_DIR_NAME: &str = ".staging";

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("failed to serialize activity record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("activity record serialized to an empty payload")]
    EmptyPayload,

    #[error("activity log entry already exists: {0}")]
    Collision(PathBuf),

    #[error("activity log IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "Kind")]
pub enum ActivityRecord {
    Upload {
        #[serde(rename = "Object")]
        object: String,
        #[serde(rename = "BucketType", skip_serializing_if = "Option::is_none")]
        bucket_type: Option<String>,
        #[serde(rename = "MIME")]
        mime: String,
        /// Capture date of the file (local calendar date)
        #[serde(rename = "DateTime")]
        date_time: String,
        #[serde(rename = "UploadDateTime")]
        upload_date_time: String,
    },
    Request {
        #[serde(rename = "Task")]
        task: String,
        #[serde(rename = "Detail")]
        detail: String,
        #[serde(rename = "DateTime")]
        date_time: String,
    },
}

impl ActivityRecord {
    pub fn upload(
        object: impl Into<String>,
        bucket_type: Option<&str>,
        mime: impl Into<String>,
        uploaded_at: DateTime<Local>,
    ) -> Self {
        ActivityRecord::Upload {
            object: object.into(),
            bucket_type: bucket_type.map(str::to_string),
            mime: mime.into(),
            date_time: uploaded_at.date_naive().to_string(),
            upload_date_time: iso_timestamp(uploaded_at),
        }
    }

    /// Emitted whenever an upload was rejected for stale credentials
    pub fn credential_request(at: DateTime<Local>) -> Self {
        ActivityRecord::Request {
            task: "S3AccessKeyUpdate".to_string(),
            detail: "none".to_string(),
            date_time: iso_timestamp(at),
        }
    }
}

#[derive(Serialize)]
struct HashedRecord<'a> {
    #[serde(flatten)]
    record: &'a ActivityRecord,
    #[serde(rename = "ContentHash")]
    content_hash: &'a str,
}

fn iso_timestamp(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Writer for the activity log directory
pub struct ActivityLogger {
    log_dir: PathBuf,
    staging_dir: PathBuf,
    seq: AtomicU64,
}

impl ActivityLogger {
    /// Create the logger, making sure the log and staging directories exist
    pub fn new(log_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let log_dir = log_dir.into();
        let staging_dir = log_dir.join(STAGING_DIR_NAME);
        std::fs::create_dir_all(&staging_dir)?;

        Ok(Self {
            log_dir,
            staging_dir,
            seq: AtomicU64::new(0),
        })
    }

    /// Commit a record and return the path it became visible under
    pub async fn commit(&self, record: &ActivityRecord) -> Result<PathBuf, ActivityError> {
        self.commit_at(record, Local::now()).await
    }

    /// Best-effort commit: failures are logged as lost events and swallowed
    pub async fn record(&self, record: ActivityRecord) {
        match self.commit(&record).await {
            Ok(path) => info!("Activity log committed to {}", path.display()),
            Err(e) => error!("Activity event lost ({:?}): {}", record, e),
        }
    }

    async fn commit_at(
        &self,
        record: &ActivityRecord,
        now: DateTime<Local>,
    ) -> Result<PathBuf, ActivityError> {
        let json = serde_json::to_string(record)?;
        if json.is_empty() {
            return Err(ActivityError::EmptyPayload);
        }
        let content_hash = format!("{:x}", md5::compute(json.as_bytes()));

        let payload = serde_json::to_vec(&HashedRecord {
            record,
            content_hash: &content_hash,
        })?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .staging_dir
            .join(format!("transferring.activity-{}-{}", std::process::id(), seq));

        if let Err(e) = write_synced(&tmp_path, &payload).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        if tokio::fs::metadata(&tmp_path).await?.len() == 0 {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ActivityError::EmptyPayload);
        }

        let final_path = self.log_dir.join(format!(
            "activity_{}_{}.json",
            iso_timestamp(now),
            content_hash
        ));

        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ActivityError::Collision(final_path));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        Ok(final_path)
    }
}

async fn write_synced(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(payload).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_upload() -> ActivityRecord {
        ActivityRecord::Upload {
            object: "note.txt".to_string(),
            bucket_type: Some("texts".to_string()),
            mime: "text/plain".to_string(),
            date_time: "2024-05-01".to_string(),
            upload_date_time: "2024-05-01T10:00:00.000000".to_string(),
        }
    }

    fn list_names(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_commit_writes_hashed_record() {
        let dir = TempDir::new().unwrap();
        let logger = ActivityLogger::new(dir.path()).unwrap();
        let record = sample_upload();

        let path = logger.commit(&record).await.unwrap();

        let unhashed = serde_json::to_string(&record).unwrap();
        let expected_hash = format!("{:x}", md5::compute(unhashed.as_bytes()));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("activity_"));
        assert!(name.ends_with(&format!("_{}.json", expected_hash)));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["Kind"], "Upload");
        assert_eq!(written["Object"], "note.txt");
        assert_eq!(written["BucketType"], "texts");
        assert_eq!(written["MIME"], "text/plain");
        assert_eq!(written["ContentHash"], expected_hash.as_str());
    }

    #[tokio::test]
    async fn test_no_transferring_files_visible() {
        let dir = TempDir::new().unwrap();
        let logger = ActivityLogger::new(dir.path()).unwrap();

        logger.commit(&sample_upload()).await.unwrap();
        logger
            .commit(&ActivityRecord::credential_request(Local::now()))
            .await
            .unwrap();

        for name in list_names(dir.path()) {
            assert!(
                !name.starts_with("transferring.activity-"),
                "unexpected staging file {}",
                name
            );
            assert!(name == STAGING_DIR_NAME || name.starts_with("activity_"));
        }
        assert!(list_names(&dir.path().join(STAGING_DIR_NAME)).is_empty());
    }

    #[tokio::test]
    async fn test_collision_discards_temp_file() {
        let dir = TempDir::new().unwrap();
        let logger = ActivityLogger::new(dir.path()).unwrap();
        let record = sample_upload();
        let now = Local::now();

        logger.commit_at(&record, now).await.unwrap();
        let second = logger.commit_at(&record, now).await;

        assert!(matches!(second, Err(ActivityError::Collision(_))));
        assert!(list_names(&dir.path().join(STAGING_DIR_NAME)).is_empty());
        let committed: Vec<_> = list_names(dir.path())
            .into_iter()
            .filter(|n| n.starts_with("activity_"))
            .collect();
        assert_eq!(committed.len(), 1);
    }

    #[tokio::test]
    async fn test_request_record_shape() {
        let dir = TempDir::new().unwrap();
        let logger = ActivityLogger::new(dir.path()).unwrap();

        let path = logger
            .commit(&ActivityRecord::credential_request(Local::now()))
            .await
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["Kind"], "Request");
        assert_eq!(written["Task"], "S3AccessKeyUpdate");
        assert_eq!(written["Detail"], "none");
        assert!(written.get("BucketType").is_none());
    }

    #[tokio::test]
    async fn test_record_swallows_failures() {
        let dir = TempDir::new().unwrap();
        let logger = ActivityLogger::new(dir.path().join("logs")).unwrap();
        std::fs::remove_dir_all(dir.path().join("logs")).unwrap();

        // staging dir is gone; the event is lost but nothing panics or propagates
        logger.record(sample_upload()).await;
        assert!(!dir.path().join("logs").exists());
    }
}
