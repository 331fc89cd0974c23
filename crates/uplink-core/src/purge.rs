//! Memory-pressure purge and archive expiry
//!
//! Three loops make up the purge subsystem:
//! - the sampler reads memory utilisation on a fixed interval and pushes a
//!   pressure flag onto a queue;
//! - the worker drains that queue and, on pressure, deletes the oldest files
//!   of every purge folder until utilisation is back at the resume level;
//! - the archive sweep expires old files from the archive directories on its
//!   own schedule, regardless of memory.

use crate::memory::MemoryProbe;
use crate::settings::AgentSettings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PurgeSettings {
    pub check_interval: Duration,
    pub threshold_percent: f32,
    pub resume_percent: f32,
    /// Files younger than this are never purged
    pub purge_age: Duration,
    pub archive_dirs: Vec<PathBuf>,
    pub archive_max_age: Duration,
    pub archive_check_interval: Duration,
}

impl PurgeSettings {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            check_interval: settings.memory_check_interval(),
            threshold_percent: settings.purge_threshold_percent,
            resume_percent: settings.purge_resume_percent,
            purge_age: settings.purge_interval(),
            archive_dirs: settings.archive_dirs.clone(),
            archive_max_age: settings.archive_max_age(),
            archive_check_interval: settings.archive_check_interval(),
        }
    }
}

/// What one folder purge did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub deleted: usize,
    /// Utilisation reached the resume level
    pub relieved: bool,
}

pub struct PurgeManager {
    folders: Arc<Vec<PathBuf>>,
    probe: Arc<dyn MemoryProbe>,
    settings: PurgeSettings,
}

impl PurgeManager {
    pub fn new(folders: Vec<PathBuf>, probe: Arc<dyn MemoryProbe>, settings: PurgeSettings) -> Self {
        Self {
            folders: Arc::new(folders),
            probe,
            settings,
        }
    }

    /// Start the sampler, the purge worker and the archive sweep
    pub fn spawn(self, cancel: CancellationToken) -> PurgeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(self);

        let tasks = vec![
            tokio::spawn(sample_memory(
                manager.probe.clone(),
                manager.settings.clone(),
                tx,
                cancel.clone(),
            )),
            tokio::spawn(manager.clone().run_worker(rx, cancel.clone())),
            tokio::spawn(sweep_archives_periodically(
                manager.settings.clone(),
                cancel.clone(),
            )),
        ];

        PurgeHandle { cancel, tasks }
    }

    async fn run_worker(self: Arc<Self>, mut rx: UnboundedReceiver<bool>, cancel: CancellationToken) {
        debug!("Purge worker started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = rx.recv() => match signal {
                    Some(true) => {
                        info!("Triggering data purge");
                        self.purge_all().await;
                    }
                    Some(false) => {}
                    None => break,
                },
            }
        }
        debug!("Purge worker stopped");
    }

    /// Purge every folder concurrently and wait for all of them
    pub async fn purge_all(&self) -> Vec<PurgeOutcome> {
        let mut set = JoinSet::new();
        for folder in self.folders.iter() {
            let folder = folder.clone();
            let probe = self.probe.clone();
            let purge_age = self.settings.purge_age;
            let resume = self.settings.resume_percent;
            set.spawn(async move { purge_folder(&folder, probe.as_ref(), purge_age, resume).await });
        }

        let mut outcomes = Vec::with_capacity(self.folders.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Purge task failed: {}", e),
            }
        }
        outcomes
    }
}

async fn sample_memory(
    probe: Arc<dyn MemoryProbe>,
    settings: PurgeSettings,
    tx: UnboundedSender<bool>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let used = probe.used_percent();
                let pressure = used > settings.threshold_percent;
                if pressure {
                    info!(used_percent = used, "Memory threshold exceeded");
                } else {
                    debug!(used_percent = used, "Memory usage normal");
                }
                if tx.send(pressure).is_err() {
                    break;
                }
            }
        }
    }
}

async fn sweep_archives_periodically(settings: PurgeSettings, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(settings.archive_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for dir in &settings.archive_dirs {
                    let removed = purge_archive_dir(dir, settings.archive_max_age).await;
                    if removed > 0 {
                        info!(removed, "Expired archived files in {}", dir.display());
                    }
                }
            }
        }
    }
}

fn age_of(modified: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}

async fn files_by_age(dir: &Path) -> std::io::Result<Vec<(SystemTime, PathBuf)>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        match entry.metadata().await {
            Ok(meta) if meta.is_file() => {
                if let Ok(modified) = meta.modified() {
                    files.push((modified, entry.path()));
                }
            }
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}

/// Delete the oldest files of `dir` that are older than `purge_age`,
/// re-reading memory after every deletion and stopping as soon as it is at
/// or below `resume_percent`
pub async fn purge_folder(
    dir: &Path,
    probe: &dyn MemoryProbe,
    purge_age: Duration,
    resume_percent: f32,
) -> PurgeOutcome {
    info!("Purging data in {}", dir.display());
    let mut outcome = PurgeOutcome::default();

    let files = match files_by_age(dir).await {
        Ok(files) => files,
        Err(e) => {
            error!("Error purging data in {}: {}", dir.display(), e);
            return outcome;
        }
    };

    let now = SystemTime::now();
    for (modified, path) in files {
        // sorted oldest first, nothing after this is old enough either
        if age_of(modified, now) <= purge_age {
            break;
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Failed to delete {}: {}", path.display(), e);
            continue;
        }
        outcome.deleted += 1;
        info!("Deleted file: {}", path.display());

        let used = probe.used_percent();
        if used <= resume_percent {
            info!(used_percent = used, "Memory usage below threshold, resuming monitoring");
            outcome.relieved = true;
            break;
        }
    }

    outcome
}

/// Recursively delete files under `dir` last modified more than `max_age` ago
pub async fn purge_archive_dir(dir: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read archive directory {}: {}", current.display(), e);
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error listing {}: {}", current.display(), e);
                    break;
                }
            };
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                pending.push(entry.path());
                continue;
            }
            let expired = meta
                .modified()
                .map(|m| age_of(m, now) > max_age)
                .unwrap_or(false);
            if !expired {
                continue;
            }

            let path = entry.path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!("Purging old archived file: {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to purge {}: {}", path.display(), e),
            }
        }
    }

    removed
}

/// Handle to the running purge loops
pub struct PurgeHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PurgeHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Purge task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Utilisation that drops by one point on every read after a deletion
    struct SteppingProbe {
        current: Mutex<f32>,
    }

    impl SteppingProbe {
        fn starting_at(value: f32) -> Self {
            Self {
                current: Mutex::new(value),
            }
        }
    }

    impl MemoryProbe for SteppingProbe {
        fn used_percent(&self) -> f32 {
            let mut current = self.current.lock().unwrap();
            *current -= 1.0;
            *current
        }
    }

    struct ConstantProbe(f32);

    impl MemoryProbe for ConstantProbe {
        fn used_percent(&self) -> f32 {
            self.0
        }
    }

    fn write_aged(path: &Path, age: Duration) {
        std::fs::write(path, "payload").unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    fn settings(archive_dirs: Vec<PathBuf>) -> PurgeSettings {
        PurgeSettings {
            check_interval: Duration::from_secs(300),
            threshold_percent: 90.0,
            resume_percent: 85.0,
            purge_age: Duration::from_secs(300),
            archive_dirs,
            archive_max_age: Duration::from_secs(30 * 24 * 60 * 60),
            archive_check_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_hysteresis_stops_at_resume_level() {
        let dir = TempDir::new().unwrap();
        for i in 0..10 {
            write_aged(
                &dir.path().join(format!("frame-{}.jpg", i)),
                Duration::from_secs(3600 + (10 - i) * 60),
            );
        }
        let probe = SteppingProbe::starting_at(92.0);

        let outcome = purge_folder(dir.path(), &probe, Duration::from_secs(300), 85.0).await;

        // 91, 90, ... 85: seven deletions, and 90 was not a stopping point
        assert_eq!(outcome.deleted, 7);
        assert!(outcome.relieved);
        assert_eq!(*probe.current.lock().unwrap(), 85.0);

        let mut left: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        // the three youngest survive
        assert_eq!(left, vec!["frame-7.jpg", "frame-8.jpg", "frame-9.jpg"]);
    }

    #[tokio::test]
    async fn test_young_files_are_kept() {
        let dir = TempDir::new().unwrap();
        write_aged(&dir.path().join("old.jpg"), Duration::from_secs(600));
        write_aged(&dir.path().join("fresh.jpg"), Duration::from_secs(30));

        let outcome = purge_folder(dir.path(), &ConstantProbe(99.0), Duration::from_secs(300), 85.0)
            .await;

        assert_eq!(outcome.deleted, 1);
        assert!(!outcome.relieved);
        assert!(dir.path().join("fresh.jpg").exists());
    }

    #[tokio::test]
    async fn test_missing_folder_is_not_fatal() {
        let outcome = purge_folder(
            Path::new("/nonexistent/purge/dir"),
            &ConstantProbe(99.0),
            Duration::from_secs(300),
            85.0,
        )
        .await;
        assert_eq!(outcome, PurgeOutcome::default());
    }

    #[tokio::test]
    async fn test_purge_all_covers_every_folder() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        for dir in [&a, &b] {
            write_aged(&dir.path().join("one.txt"), Duration::from_secs(900));
            write_aged(&dir.path().join("two.txt"), Duration::from_secs(800));
        }
        let manager = PurgeManager::new(
            vec![a.path().to_path_buf(), b.path().to_path_buf()],
            Arc::new(ConstantProbe(95.0)),
            settings(Vec::new()),
        );

        let outcomes = manager.purge_all().await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.deleted == 2));
        assert_eq!(count_files(a.path()), 0);
        assert_eq!(count_files(b.path()), 0);
    }

    #[tokio::test]
    async fn test_archive_sweep_is_recursive() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("2024").join("05");
        std::fs::create_dir_all(&nested).unwrap();
        let month = Duration::from_secs(31 * 24 * 60 * 60);
        write_aged(&dir.path().join("old.tgz"), month);
        write_aged(&nested.join("old.tgz"), month);
        write_aged(&nested.join("recent.tgz"), Duration::from_secs(3600));

        let removed = purge_archive_dir(dir.path(), Duration::from_secs(30 * 24 * 60 * 60)).await;

        assert_eq!(removed, 2);
        assert!(nested.join("recent.tgz").exists());
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn test_pressure_signal_triggers_purge() {
        let dir = TempDir::new().unwrap();
        write_aged(&dir.path().join("old.jpg"), Duration::from_secs(900));
        let manager = PurgeManager::new(
            vec![dir.path().to_path_buf()],
            Arc::new(ConstantProbe(95.0)),
            settings(Vec::new()),
        );

        let handle = manager.spawn(CancellationToken::new());
        // the first sample is taken immediately
        for _ in 0..200 {
            if count_files(dir.path()) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(count_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_no_pressure_leaves_files() {
        let dir = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        write_aged(&dir.path().join("old.jpg"), Duration::from_secs(900));
        write_aged(
            &archive.path().join("ancient.tgz"),
            Duration::from_secs(60 * 24 * 60 * 60),
        );
        let manager = PurgeManager::new(
            vec![dir.path().to_path_buf()],
            Arc::new(ConstantProbe(50.0)),
            settings(vec![archive.path().to_path_buf()]),
        );

        let handle = manager.spawn(CancellationToken::new());
        // the archive sweep is not memory gated
        for _ in 0..200 {
            if count_files(archive.path()) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(count_files(archive.path()), 0);
        assert!(dir.path().join("old.jpg").exists());
    }
}
