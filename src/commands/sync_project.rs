use crate::config::CatalogConfig;
use crate::db::Database;
use crate::sync::{SyncEvent, SyncJob, SyncRegistry, Synchronizer};
use anyhow::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

pub fn sync_project(
    database: &Path,
    config: &CatalogConfig,
    project: &str,
    resync: bool,
    files: Vec<String>,
    base_dir: Option<String>,
) -> Result<()> {
    // The worker thread gets its own connection
    let db = Database::open(database)?;
    let project_id = db.resolve_project(project)?;

    let mut job = SyncJob::new(project_id).with_resync(resync);
    if !files.is_empty() {
        job = job.with_files(files.into_iter().map(PathBuf::from).collect());
    }
    if let Some(dir) = base_dir {
        job = job.with_base_dir(dir);
    }

    let (tx, rx) = mpsc::channel();
    let registry = SyncRegistry::new();
    let handle = registry.spawn(Synchronizer::from_config(db, config), job, tx)?;

    let mut total = 0;
    for event in rx {
        match event {
            SyncEvent::Total(n) => {
                total = n;
                println!("Found {} files", n);
            }
            SyncEvent::Processed(n) => {
                print!("\rProcessed {}/{}", n, total);
                std::io::stdout().flush()?;
            }
            // Already written by the tracing subscriber
            SyncEvent::Log { .. } => {}
            SyncEvent::Completed => {
                println!();
                break;
            }
        }
    }

    let summary = handle.join()?;
    println!(
        "Inserted {}, unmeasured {}, duplicates {}, failed {}, deleted {}{}",
        summary.inserted,
        summary.unmeasured,
        summary.duplicates,
        summary.failed,
        summary.deleted,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}
