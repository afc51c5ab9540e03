use crate::config::CatalogConfig;
use crate::db::{CatalogStore, Database};
use crate::models::ProjectStatus;
use crate::scanner::PathScanner;
use crate::sync::{NullObserver, SyncJob, Synchronizer};
use crate::watch::FolderWatcher;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::info;

/// Catalog new images as they land in the project folder, until interrupted
pub fn watch_project(
    database: &Path,
    config: &CatalogConfig,
    project: &str,
    settle_secs: f64,
) -> Result<()> {
    let db = Database::open(database)?;
    let project_id = db.resolve_project(project)?;
    let project = db
        .get_project(project_id)?
        .with_context(|| format!("Project {} not found", project_id))?;
    if project.status == ProjectStatus::Archived {
        anyhow::bail!("Project '{}' is archived", project.name);
    }
    let settle = Duration::try_from_secs_f64(settle_secs)
        .with_context(|| format!("Invalid settle time: {}", settle_secs))?;

    let base_dir = PathBuf::from(&project.base_dir);
    let watcher = FolderWatcher::new(&base_dir, PathScanner::new(&config.extensions))?;
    let synchronizer = Synchronizer::from_config(db, config);
    let cancel = AtomicBool::new(false);
    println!("Watching {} for project '{}' (Ctrl-C to stop)", base_dir.display(), project.name);

    while let Some(batch) = watcher.next_batch(settle) {
        if batch.is_empty() {
            continue;
        }
        info!("{} new file(s) in {}", batch.len(), base_dir.display());

        let job = SyncJob::new(project_id).with_files(batch);
        // Fatal errors (project archived or folder gone) end the watch
        let summary = synchronizer.run(&job, &NullObserver, &cancel)?;
        println!(
            "Inserted {}, unmeasured {}, duplicates {}, failed {}",
            summary.inserted, summary.unmeasured, summary.duplicates, summary.failed
        );
    }
    Ok(())
}
