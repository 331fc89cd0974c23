//! Agent settings
//!
//! Settings are layered: built-in defaults, then an optional config file
//! (TOML, YAML or JSON, picked by extension), then `UPLINK_*` environment
//! variables. List-valued keys take comma-separated values from the
//! environment, e.g. `UPLINK_UPLOAD_FOLDERS=/data/out/texts,/data/out/images`.

use crate::error::{Result, UplinkError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file consulted when no explicit path is given
pub const DEFAULT_CONFIG_PATH: &str = "/data/uplink.toml";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "UPLINK";

/// How uploads are mapped to buckets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketMode {
    /// Route by `texts`/`images`/`videos` path components
    #[default]
    ByPath,
    /// Everything goes to `bucket`
    Fixed,
}

/// Where refreshed credentials come from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSourceKind {
    /// Wait for the device shadow file to be rewritten, then re-read it
    #[default]
    ShadowFile,
    /// Mint a temporary session through the cloud CLI
    SessionToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub state_dir: PathBuf,
    /// Defaults to `<state_dir>/uplink.db`
    pub database_path: Option<PathBuf>,
    pub activity_log_dir: PathBuf,
    pub shadow_file: PathBuf,
    /// Where log files are zipped before upload. Defaults to the system temp dir.
    pub staging_dir: Option<PathBuf>,
    pub log_file: PathBuf,
    pub bind_address: String,
    pub download_dir: PathBuf,

    pub upload_enabled: bool,
    pub upload_folders: Vec<PathBuf>,
    pub purge_folders: Vec<PathBuf>,
    pub archive_dirs: Vec<PathBuf>,

    pub bucket_mode: BucketMode,
    pub bucket: String,
    pub text_bucket: String,
    pub image_bucket: String,
    pub video_bucket: String,
    pub region: String,
    pub endpoint: Option<String>,

    pub credential_source: CredentialSourceKind,
    pub settle_delay_secs: u64,
    pub session_duration_secs: u64,
    pub session_command: String,

    pub min_process_interval_secs: u64,
    pub upload_attempts: u32,
    pub upload_backoff_secs: u64,
    pub auth_attempts: u32,

    pub memory_check_interval_secs: u64,
    pub purge_threshold_percent: f32,
    pub purge_resume_percent: f32,
    pub purge_interval_secs: u64,
    pub archive_purge_days: u64,
    pub archive_check_interval_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/data"),
            database_path: None,
            activity_log_dir: PathBuf::from("/data/logs"),
            shadow_file: PathBuf::from("/data/config.json"),
            staging_dir: None,
            log_file: PathBuf::from("/data/uploader.log"),
            bind_address: "0.0.0.0:5000".to_string(),
            download_dir: PathBuf::from("/data/download"),

            upload_enabled: true,
            upload_folders: Vec::new(),
            purge_folders: Vec::new(),
            archive_dirs: vec![
                PathBuf::from("/data/out/archive"),
                PathBuf::from("/data/dais/archives"),
            ],

            bucket_mode: BucketMode::ByPath,
            bucket: "my-upload-mgr-bucket".to_string(),
            text_bucket: "edge-texts".to_string(),
            image_bucket: "edge-images".to_string(),
            video_bucket: "edge-videos".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,

            credential_source: CredentialSourceKind::ShadowFile,
            settle_delay_secs: 10,
            session_duration_secs: 12 * 60 * 60,
            session_command: "aws".to_string(),

            min_process_interval_secs: 60,
            upload_attempts: 3,
            upload_backoff_secs: 1,
            auth_attempts: 4,

            memory_check_interval_secs: 300,
            purge_threshold_percent: 90.0,
            purge_resume_percent: 85.0,
            purge_interval_secs: 300,
            archive_purge_days: 30,
            archive_check_interval_secs: 3600,
        }
    }
}

impl AgentSettings {
    /// Load settings from defaults, an optional file and the environment.
    ///
    /// An explicit `path` must exist; the default path is used only when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        match path {
            Some(p) => {
                builder = builder.add_source(::config::File::from(p).required(true));
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    builder = builder.add_source(::config::File::from(default_path));
                }
            }
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("upload_folders")
                .with_list_parse_key("purge_folders")
                .with_list_parse_key("archive_dirs"),
        );

        let settings: AgentSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.purge_threshold_percent)
            || !(0.0..=100.0).contains(&self.purge_resume_percent)
        {
            return Err(UplinkError::InvalidConfig(
                "purge percentages must be within 0..=100".to_string(),
            ));
        }
        if self.purge_resume_percent >= self.purge_threshold_percent {
            return Err(UplinkError::InvalidConfig(format!(
                "purge_resume_percent ({}) must be below purge_threshold_percent ({})",
                self.purge_resume_percent, self.purge_threshold_percent
            )));
        }
        if self.upload_attempts == 0 || self.auth_attempts == 0 {
            return Err(UplinkError::InvalidConfig(
                "upload_attempts and auth_attempts must be at least 1".to_string(),
            ));
        }
        let mut buckets = vec![self.bucket.as_str()];
        if self.bucket_mode == BucketMode::ByPath {
            buckets.extend([
                self.text_bucket.as_str(),
                self.image_bucket.as_str(),
                self.video_bucket.as_str(),
            ]);
        }
        if buckets.iter().any(|b| b.trim().is_empty()) {
            return Err(UplinkError::InvalidConfig(
                "bucket names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("uplink.db"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// File the last-known-bad credentials are written to before a refresh
    pub fn recovery_cache_path(&self) -> PathBuf {
        self.state_dir.join("expired_key_cache.json")
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn min_process_interval(&self) -> Duration {
        Duration::from_secs(self.min_process_interval_secs)
    }

    pub fn upload_backoff(&self) -> Duration {
        Duration::from_secs(self.upload_backoff_secs)
    }

    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_secs(self.memory_check_interval_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn archive_max_age(&self) -> Duration {
        Duration::from_secs(self.archive_purge_days * 24 * 60 * 60)
    }

    pub fn archive_check_interval(&self) -> Duration {
        Duration::from_secs(self.archive_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = AgentSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.min_process_interval(), Duration::from_secs(60));
        assert_eq!(settings.purge_threshold_percent, 90.0);
        assert_eq!(settings.purge_resume_percent, 85.0);
        assert_eq!(
            settings.recovery_cache_path(),
            PathBuf::from("/data/expired_key_cache.json")
        );
    }

    #[test]
    fn test_load_from_toml_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("uplink.toml");
        std::fs::write(
            &path,
            r#"
state_dir = "/var/lib/uplink"
bucket_mode = "fixed"
bucket = "device-42"
upload_folders = ["/data/out/texts", "/data/out/images"]
purge_resume_percent = 80.0
credential_source = "session_token"
"#,
        )?;

        let settings = AgentSettings::load(Some(&path))?;
        assert_eq!(settings.bucket_mode, BucketMode::Fixed);
        assert_eq!(settings.bucket, "device-42");
        assert_eq!(settings.upload_folders.len(), 2);
        assert_eq!(settings.purge_resume_percent, 80.0);
        assert_eq!(settings.credential_source, CredentialSourceKind::SessionToken);
        assert_eq!(
            settings.database_path(),
            PathBuf::from("/var/lib/uplink/uplink.db")
        );
        // untouched keys keep their defaults
        assert_eq!(settings.memory_check_interval_secs, 300);
        Ok(())
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = AgentSettings::load(Some(Path::new("/nonexistent/uplink.toml")));
        assert!(matches!(result, Err(UplinkError::Config(_))));
    }

    #[test]
    fn test_resume_must_be_below_threshold() {
        let settings = AgentSettings {
            purge_resume_percent: 90.0,
            ..AgentSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(UplinkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_empty_fixed_bucket_rejected() {
        let settings = AgentSettings {
            bucket_mode: BucketMode::Fixed,
            bucket: "  ".to_string(),
            ..AgentSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
