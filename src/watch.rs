//! Folder monitoring: turns file-system notifications under a project folder
//! into batches of new image files for an explicit-list sync.

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::scanner::PathScanner;

/// Recursive watch on one folder. Dropping it stops the watch.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    scanner: PathScanner,
}

impl FolderWatcher {
    pub fn new(base_dir: &Path, scanner: PathScanner) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher =
            notify::recommended_watcher(tx).context("Failed to create file watcher")?;
        watcher
            .watch(base_dir, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", base_dir.display()))?;
        info!("Watching {}", base_dir.display());

        Ok(Self {
            _watcher: watcher,
            events: rx,
            scanner,
        })
    }

    /// Block until something happens, then keep collecting until the folder has
    /// been quiet for `settle`. The batch may be empty when nothing relevant
    /// was created. `None` once the watcher is gone.
    pub fn next_batch(&self, settle: Duration) -> Option<Vec<PathBuf>> {
        collect_batch(&self.events, &self.scanner, settle)
    }
}

fn collect_batch(
    events: &Receiver<notify::Result<Event>>,
    scanner: &PathScanner,
    settle: Duration,
) -> Option<Vec<PathBuf>> {
    let mut batch = BTreeSet::new();
    let first = events.recv().ok()?;
    add_event(first, scanner, &mut batch);

    loop {
        match events.recv_timeout(settle) {
            Ok(event) => add_event(event, scanner, &mut batch),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Files may be gone again by the time the folder settles
    Some(batch.into_iter().filter(|path| path.is_file()).collect())
}

fn add_event(
    event: notify::Result<Event>,
    scanner: &PathScanner,
    batch: &mut BTreeSet<PathBuf>,
) {
    match event {
        Ok(event) => {
            for path in new_image_files(&event, scanner) {
                debug!("New image: {}", path.display());
                batch.insert(path);
            }
        }
        Err(e) => warn!("File watcher error: {}", e),
    }
}

/// Image files an event brings into the folder: creations and rename targets
pub fn new_image_files(event: &Event, scanner: &PathScanner) -> Vec<PathBuf> {
    let targets: &[PathBuf] = match event.kind {
        EventKind::Create(_) => &event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => &event.paths,
        // Paths are [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().map(std::slice::from_ref).unwrap_or_default()
        }
        _ => &[],
    };

    targets
        .iter()
        .filter(|path| scanner.matches(path))
        .cloned()
        .collect()
}
