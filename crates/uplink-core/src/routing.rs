//! Bucket selection for uploads

use crate::settings::{AgentSettings, BucketMode};
use crate::types::MediaClass;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Where one file goes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub bucket: String,
    pub class: MediaClass,
}

impl Destination {
    /// `BucketType` label for activity records
    pub fn bucket_type(&self) -> &'static str {
        self.class.bucket_type()
    }
}

type Classifier = dyn Fn(&Path) -> Destination + Send + Sync;

/// Injectable path → bucket classifier
#[derive(Clone)]
pub struct BucketRouter {
    classify: Arc<Classifier>,
}

impl BucketRouter {
    pub fn new<F>(classify: F) -> Self
    where
        F: Fn(&Path) -> Destination + Send + Sync + 'static,
    {
        Self {
            classify: Arc::new(classify),
        }
    }

    /// Route by media class; unmatched paths land in `fallback`
    pub fn by_path(
        text_bucket: impl Into<String>,
        image_bucket: impl Into<String>,
        video_bucket: impl Into<String>,
        fallback: impl Into<String>,
    ) -> Self {
        let text = text_bucket.into();
        let image = image_bucket.into();
        let video = video_bucket.into();
        let fallback = fallback.into();

        Self::new(move |path| {
            let class = MediaClass::from_path(path);
            let bucket = match class {
                MediaClass::Text => &text,
                MediaClass::Image => &image,
                MediaClass::Video => &video,
                MediaClass::Archive | MediaClass::Other => &fallback,
            };
            Destination {
                bucket: bucket.clone(),
                class,
            }
        })
    }

    /// Send everything to a single bucket
    pub fn fixed(bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self::new(move |path| Destination {
            bucket: bucket.clone(),
            class: MediaClass::from_path(path),
        })
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        match settings.bucket_mode {
            BucketMode::ByPath => Self::by_path(
                settings.text_bucket.clone(),
                settings.image_bucket.clone(),
                settings.video_bucket.clone(),
                settings.bucket.clone(),
            ),
            BucketMode::Fixed => Self::fixed(settings.bucket.clone()),
        }
    }

    pub fn route(&self, path: &Path) -> Destination {
        (self.classify)(path)
    }
}

impl fmt::Debug for BucketRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketRouter").finish_non_exhaustive()
    }
}
