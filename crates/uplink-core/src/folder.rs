//! Per-folder upload pipeline
//!
//! One [`FolderWatcher`] task runs per monitored directory. Every creation
//! or move-in event first triggers a missed-file sweep of the directory and
//! then processes the event's own file. Processing a file means bundling it
//! if it is a log, uploading it with exponential backoff and deleting the
//! local copies once the upload is confirmed.

use crate::archive::{archive_log_file, is_log_file};
use crate::error::Result;
use crate::settings::AgentSettings;
use crate::types::WatchedFolder;
use crate::upload::{UploadError, Uploader};
use crate::watcher::{watch_folder, WatchEvent};
use notify::RecommendedWatcher;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Files older than this are picked up by the missed-file sweep
    pub min_process_interval: Duration,
    pub attempts: u32,
    /// First backoff delay, doubled after every failure
    pub base_backoff: Duration,
    /// Where log bundles are built
    pub staging_dir: PathBuf,
}

impl WatcherSettings {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            min_process_interval: settings.min_process_interval(),
            attempts: settings.upload_attempts,
            base_backoff: settings.upload_backoff(),
            staging_dir: settings.staging_dir(),
        }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            min_process_interval: Duration::from_secs(60),
            attempts: 3,
            base_backoff: Duration::from_secs(1),
            staging_dir: std::env::temp_dir(),
        }
    }
}

/// Dedup state. A path lives in at most one of the two sets.
#[derive(Debug, Default)]
struct FileTracker {
    processing: HashSet<PathBuf>,
    processed: HashSet<PathBuf>,
}

impl FileTracker {
    fn is_tracked(&self, path: &Path) -> bool {
        self.processing.contains(path) || self.processed.contains(path)
    }

    fn begin(&mut self, path: &Path) {
        self.processed.remove(path);
        self.processing.insert(path.to_path_buf());
    }

    fn finish(&mut self, path: &Path, uploaded: bool) {
        self.processing.remove(path);
        if uploaded {
            self.processed.insert(path.to_path_buf());
        }
    }

    /// Forget processed files that are gone, so a later file with the same
    /// name is picked up again
    fn prune(&mut self) {
        self.processed.retain(|p| p.exists());
    }
}

pub struct FolderWatcher {
    folder: WatchedFolder,
    uploader: Arc<dyn Uploader>,
    settings: WatcherSettings,
    tracker: FileTracker,
    in_flight: watch::Sender<usize>,
}

impl FolderWatcher {
    pub fn new(
        folder: WatchedFolder,
        uploader: Arc<dyn Uploader>,
        settings: WatcherSettings,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            folder,
            uploader,
            settings,
            tracker: FileTracker::default(),
            in_flight,
        }
    }

    /// Watch the folder on disk until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> Result<WatcherHandle> {
        let (watcher, events) = watch_folder(&self.folder.path)?;
        Ok(self.spawn_inner(events, cancel, Some(watcher)))
    }

    /// Run against an externally supplied event stream. The loop also ends
    /// when every sender is dropped.
    pub fn spawn_with_events(
        self,
        events: UnboundedReceiver<WatchEvent>,
        cancel: CancellationToken,
    ) -> WatcherHandle {
        self.spawn_inner(events, cancel, None)
    }

    fn spawn_inner(
        self,
        events: UnboundedReceiver<WatchEvent>,
        cancel: CancellationToken,
        fs_watcher: Option<RecommendedWatcher>,
    ) -> WatcherHandle {
        let folder = self.folder.path.clone();
        let in_flight = self.in_flight.subscribe();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            // keeps the OS watch registered for the task's lifetime
            let _fs_watcher = fs_watcher;
            self.run(events, token).await;
        });

        WatcherHandle {
            folder,
            cancel,
            in_flight,
            task,
        }
    }

    async fn run(mut self, mut events: UnboundedReceiver<WatchEvent>, cancel: CancellationToken) {
        info!(
            class = %self.folder.media_class,
            "Monitoring started for folder: {}",
            self.folder.path.display()
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &cancel).await,
                    None => {
                        debug!("Event stream closed for {}", self.folder.path.display());
                        break;
                    }
                },
            }
        }

        info!("Monitoring stopped for folder: {}", self.folder.path.display());
    }

    async fn handle_event(&mut self, event: WatchEvent, cancel: &CancellationToken) {
        debug!("Event received: {:?}", event);
        self.sweep_missed_files(cancel).await;
        if cancel.is_cancelled() {
            return;
        }
        self.process_file(event.path()).await;
    }

    /// Upload untracked files that have been sitting in the folder longer
    /// than the minimum process interval, oldest first. Stops between files
    /// once `cancel` fires.
    async fn sweep_missed_files(&mut self, cancel: &CancellationToken) {
        self.tracker.prune();

        let missed = match self.list_missed_files().await {
            Ok(missed) => missed,
            Err(e) => {
                warn!(
                    "Failed to scan {} for missed files: {}",
                    self.folder.path.display(),
                    e
                );
                return;
            }
        };

        if !missed.is_empty() {
            info!(
                count = missed.len(),
                "Processing missed files in {}",
                self.folder.path.display()
            );
        }
        for path in missed {
            if cancel.is_cancelled() {
                debug!("Sweep of {} cut short by shutdown", self.folder.path.display());
                return;
            }
            self.process_file(&path).await;
        }
    }

    async fn list_missed_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let now = SystemTime::now();
        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.folder.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if self.tracker.is_tracked(&path) {
                continue;
            }
            // the file may vanish between listing and stat
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let modified = match meta.modified() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > self.settings.min_process_interval {
                candidates.push((modified, path));
            }
        }

        candidates.sort();
        Ok(candidates.into_iter().map(|(_, path)| path).collect())
    }

    async fn process_file(&mut self, path: &Path) {
        if self.tracker.is_tracked(path) {
            debug!("Already handled: {}", path.display());
            return;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                debug!("Skipping {}: not a regular file", path.display());
                return;
            }
        }

        self.tracker.begin(path);
        self.in_flight.send_replace(self.tracker.processing.len());

        let uploaded = self.upload_and_cleanup(path).await;

        self.tracker.finish(path, uploaded);
        self.in_flight.send_replace(self.tracker.processing.len());
    }

    async fn upload_and_cleanup(&self, path: &Path) -> bool {
        let bundled = is_log_file(path);
        let upload_path = if bundled {
            match archive_log_file(path, &self.settings.staging_dir).await {
                Ok(bundle) => bundle,
                Err(e) => {
                    error!("Failed to archive {}: {}", path.display(), e);
                    return false;
                }
            }
        } else {
            path.to_path_buf()
        };

        let uploaded = self.upload_with_backoff(&upload_path, path).await;

        if uploaded {
            remove_file_logged(&upload_path).await;
            if bundled {
                remove_file_logged(path).await;
            }
        } else if bundled {
            // rebuilt from the original on the next attempt
            let _ = tokio::fs::remove_file(&upload_path).await;
        }
        uploaded
    }

    async fn upload_with_backoff(&self, upload_path: &Path, origin: &Path) -> bool {
        let mut delay = self.settings.base_backoff;

        for attempt in 1..=self.settings.attempts {
            match self.uploader.upload(upload_path, origin).await {
                Ok(()) => return true,
                Err(e @ UploadError::MaxRetriesReached { .. }) => {
                    error!("{}; leaving {} for the next sweep", e, origin.display());
                    return false;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        "Upload failed: {}. Retrying after {:?}", e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        error!(
            attempts = self.settings.attempts,
            "Giving up on {} for now",
            origin.display()
        );
        false
    }
}

async fn remove_file_logged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("File removed: {}", path.display()),
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Control handle for a running watcher task
pub struct WatcherHandle {
    folder: PathBuf,
    cancel: CancellationToken,
    in_flight: watch::Receiver<usize>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Stop accepting events. The file being processed, if any, finishes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once no file is being processed
    pub async fn wait_for_completion(&self) {
        let mut in_flight = self.in_flight.clone();
        // sender dropped means the task is gone, which is also "idle"
        let _ = in_flight.wait_for(|n| *n == 0).await;
    }

    /// Wait for the task to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Watcher for {} ended abnormally: {}", self.folder.display(), e);
        }
    }

    pub async fn shutdown(self) {
        self.cancel();
        self.join().await;
    }
}
