//! Core type definitions for Uplink

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Kind of media a folder (or file) carries, derived from its path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaClass {
    Text,
    Image,
    Video,
    Archive,
    Other,
}

impl MediaClass {
    /// Classify a path by its directory components. Priority queues
    /// (`priority.texts`, ...) share the class of their regular folder.
    /// Text wins over image, image over video.
    pub fn from_path(path: &Path) -> Self {
        if has_component(path, &["texts", "priority.texts"]) {
            MediaClass::Text
        } else if has_component(path, &["images", "priority.images"]) {
            MediaClass::Image
        } else if has_component(path, &["videos", "priority.videos"]) {
            MediaClass::Video
        } else if has_component(path, &["archive", "archives"]) {
            MediaClass::Archive
        } else {
            MediaClass::Other
        }
    }

    /// Label written to the `BucketType` field of activity records
    pub fn bucket_type(&self) -> &'static str {
        match self {
            MediaClass::Text => "texts",
            MediaClass::Image => "images",
            MediaClass::Video => "videos",
            MediaClass::Archive => "archive",
            MediaClass::Other => "unknown",
        }
    }
}

impl std::fmt::Display for MediaClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bucket_type())
    }
}

fn has_component(path: &Path, names: &[&str]) -> bool {
    path.components()
        .filter_map(|c| c.as_os_str().to_str())
        .any(|c| names.contains(&c))
}

/// A directory whose new files are shipped to object storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedFolder {
    pub path: PathBuf,
    pub media_class: MediaClass,
}

impl WatchedFolder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let media_class = MediaClass::from_path(&path);
        Self { path, media_class }
    }
}

/// The active upload and purge folder lists
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSet {
    #[serde(default)]
    pub upload_folders: Vec<PathBuf>,
    #[serde(default)]
    pub purge_folders: Vec<PathBuf>,
}

impl FolderSet {
    pub fn new(upload_folders: Vec<PathBuf>, purge_folders: Vec<PathBuf>) -> Self {
        Self {
            upload_folders,
            purge_folders,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upload_folders.is_empty() && self.purge_folders.is_empty()
    }
}

/// Remote storage credentials. Expiry is never tracked locally; a failed
/// upload is what tells us they went stale.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("prefix", &self.prefix)
            .finish()
    }
}
