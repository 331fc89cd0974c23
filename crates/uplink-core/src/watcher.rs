//! Filesystem event source for watched folders

use crate::error::Result;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

/// Events the upload pipeline reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    MovedIn(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(p) | WatchEvent::MovedIn(p) => p,
        }
    }
}

/// Translate a raw notify event. Only creations and the destination side of
/// renames are kept.
pub fn classify(event: Event) -> Vec<WatchEvent> {
    match event.kind {
        EventKind::Create(_) => event.paths.into_iter().map(WatchEvent::Created).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.into_iter().map(WatchEvent::MovedIn).collect()
        }
        // paths are [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .into_iter()
            .nth(1)
            .map(WatchEvent::MovedIn)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn forward(tx: &UnboundedSender<WatchEvent>, res: notify::Result<Event>) {
    match res {
        Ok(event) => {
            for ev in classify(event) {
                let _ = tx.send(ev);
            }
        }
        Err(e) => warn!("Filesystem watch error: {}", e),
    }
}

/// Start a recursive watch on `path`.
///
/// Events arrive on the returned channel for as long as the returned watcher
/// is kept alive.
pub fn watch_folder(path: &Path) -> Result<(RecommendedWatcher, UnboundedReceiver<WatchEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| forward(&tx, res))?;
    watcher.watch(path, RecursiveMode::Recursive)?;

    Ok((watcher, rx))
}
