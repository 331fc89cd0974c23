//! Worker lifecycle
//!
//! The supervisor owns the authoritative folder set. Every watcher and the
//! purge loops run under one cancellation token; reconfiguring cancels that
//! token, joins the retired workers and starts a fresh set.

use crate::error::{Result, UplinkError};
use crate::folder::{FolderWatcher, WatcherHandle, WatcherSettings};
use crate::memory::MemoryProbe;
use crate::persistence::FolderStore;
use crate::purge::{PurgeHandle, PurgeManager, PurgeSettings};
use crate::settings::AgentSettings;
use crate::types::{FolderSet, WatchedFolder};
use crate::upload::Uploader;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub upload_enabled: bool,
    /// Used when nothing has been persisted yet
    pub initial_folders: FolderSet,
    pub watcher: WatcherSettings,
    pub purge: PurgeSettings,
}

impl SupervisorSettings {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            upload_enabled: settings.upload_enabled,
            initial_folders: FolderSet::new(
                settings.upload_folders.clone(),
                settings.purge_folders.clone(),
            ),
            watcher: WatcherSettings::from_settings(settings),
            purge: PurgeSettings::from_settings(settings),
        }
    }
}

/// Collaborators the workers are built from
pub struct SupervisorDeps {
    pub uploader: Arc<dyn Uploader>,
    pub probe: Arc<dyn MemoryProbe>,
    pub folder_store: FolderStore,
}

struct Workers {
    folders: FolderSet,
    cancel: CancellationToken,
    watchers: Vec<WatcherHandle>,
    purge: Option<PurgeHandle>,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    uploader: Arc<dyn Uploader>,
    probe: Arc<dyn MemoryProbe>,
    folder_store: FolderStore,
    workers: Mutex<Workers>,
}

impl Supervisor {
    /// Load the persisted folder set and start every worker
    pub async fn start(settings: SupervisorSettings, deps: SupervisorDeps) -> Result<Self> {
        let folders = match deps.folder_store.load().await? {
            Some(stored) => stored,
            None => {
                info!("No stored folder configuration, using configured defaults");
                settings.initial_folders.clone()
            }
        };

        let supervisor = Self {
            settings,
            uploader: deps.uploader,
            probe: deps.probe,
            folder_store: deps.folder_store,
            workers: Mutex::new(Workers {
                folders: FolderSet::default(),
                cancel: CancellationToken::new(),
                watchers: Vec::new(),
                purge: None,
            }),
        };

        {
            let mut workers = supervisor.workers.lock().await;
            *workers = supervisor.start_workers(folders);
        }
        Ok(supervisor)
    }

    fn start_workers(&self, folders: FolderSet) -> Workers {
        let cancel = CancellationToken::new();
        let mut watchers = Vec::new();

        if self.settings.upload_enabled {
            for path in &folders.upload_folders {
                let watcher = FolderWatcher::new(
                    WatchedFolder::new(path),
                    self.uploader.clone(),
                    self.settings.watcher.clone(),
                );
                match watcher.spawn(cancel.child_token()) {
                    Ok(handle) => watchers.push(handle),
                    Err(e) => error!("Failed to watch {}: {}", path.display(), e),
                }
            }
        } else {
            warn!("Uploads are disabled, folders will not be watched");
        }

        let purge = PurgeManager::new(
            folders.purge_folders.clone(),
            self.probe.clone(),
            self.settings.purge.clone(),
        )
        .spawn(cancel.child_token());

        info!(
            upload = folders.upload_folders.len(),
            purge = folders.purge_folders.len(),
            watching = watchers.len(),
            "Workers started"
        );

        Workers {
            folders,
            cancel,
            watchers,
            purge: Some(purge),
        }
    }

    async fn stop_workers(workers: &mut Workers) {
        workers.cancel.cancel();
        for handle in workers.watchers.drain(..) {
            handle.join().await;
        }
        if let Some(purge) = workers.purge.take() {
            purge.shutdown().await;
        }
    }

    /// Swap in a new folder set. Returns the applied set.
    pub async fn update_folders(&self, folders: FolderSet) -> Result<FolderSet> {
        validate_folders(&folders)?;

        let mut workers = self.workers.lock().await;
        self.folder_store.save(&folders).await?;

        info!("Reconfiguring workers");
        Self::stop_workers(&mut workers).await;
        *workers = self.start_workers(folders);

        Ok(workers.folders.clone())
    }

    pub async fn get_folders(&self) -> FolderSet {
        self.workers.lock().await.folders.clone()
    }

    /// Cancel every worker and wait for in-flight uploads to drain
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        info!("Shutting down workers");
        Self::stop_workers(&mut workers).await;
    }
}

fn validate_folders(folders: &FolderSet) -> Result<()> {
    for path in folders.upload_folders.iter().chain(&folders.purge_folders) {
        if !path.is_absolute() {
            return Err(UplinkError::InvalidConfig(format!(
                "folder paths must be absolute: {}",
                path.display()
            )));
        }
    }
    for path in &folders.upload_folders {
        if !is_dir(path) {
            return Err(UplinkError::InvalidConfig(format!(
                "upload folder does not exist: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

fn is_dir(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}
