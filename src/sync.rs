//! Folder synchronization: reconciles a project's catalog with its image folder.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn, Level};

use crate::config::CatalogConfig;
use crate::db::{CatalogError, CatalogStore};
use crate::header::HeaderExtractor;
use crate::models::{FrameMeasurement, ProjectStatus};
use crate::photometry::PhotometricAnalyzer;
use crate::scanner::PathScanner;

/// Progress notifications emitted by a running job
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Number of files the job will walk through
    Total(usize),
    /// Files handled so far, whatever their outcome
    Processed(usize),
    Log { level: Level, message: String },
    Completed,
}

/// Receives sync events. Implementations must not block.
pub trait SyncObserver: Send {
    fn notify(&self, event: SyncEvent);
}

impl SyncObserver for Sender<SyncEvent> {
    fn notify(&self, event: SyncEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.send(event);
    }
}

/// Discards events; log messages still reach the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl SyncObserver for NullObserver {
    fn notify(&self, _event: SyncEvent) {}
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("project {0} not found")]
    ProjectNotFound(i64),
    #[error("project {0} is archived")]
    ProjectArchived(i64),
    #[error("base directory not accessible: {0}")]
    BaseDirMissing(PathBuf),
    #[error("a sync is already running for project {0}")]
    AlreadyRunning(i64),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("failed to start sync worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("sync worker panicked")]
    WorkerPanicked,
}

/// Parameters of one sync run
#[derive(Debug, Clone, Default)]
pub struct SyncJob {
    pub project_id: i64,
    /// Overrides the project's stored base directory
    pub base_dir: Option<PathBuf>,
    /// Delete before ingesting instead of diffing
    pub resync: bool,
    /// Restrict the run to these files; no delete pass follows
    pub files: Option<Vec<PathBuf>>,
}

impl SyncJob {
    pub fn new(project_id: i64) -> Self {
        Self {
            project_id,
            ..Default::default()
        }
    }

    pub fn with_resync(mut self, resync: bool) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = Some(files);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSummary {
    pub total: usize,
    pub processed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Files stored with the zero measurement
    pub unmeasured: usize,
    pub deleted: usize,
    pub cancelled: bool,
}

/// Runs sync jobs against a catalog store
pub struct Synchronizer<S> {
    store: S,
    scanner: PathScanner,
    extractor: HeaderExtractor,
    analyzer: PhotometricAnalyzer,
}

impl<S: CatalogStore> Synchronizer<S> {
    pub fn new(
        store: S,
        scanner: PathScanner,
        extractor: HeaderExtractor,
        analyzer: PhotometricAnalyzer,
    ) -> Self {
        Self {
            store,
            scanner,
            extractor,
            analyzer,
        }
    }

    pub fn from_config(store: S, config: &CatalogConfig) -> Self {
        Self::new(
            store,
            PathScanner::new(&config.extensions),
            HeaderExtractor::new(config.keywords.clone()),
            PhotometricAnalyzer::new(config.analyzer.clone()),
        )
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run a job to completion or cancellation. Always ends with exactly one
    /// `Completed` event; a fatal error is also reported as one error-level log.
    pub fn run(
        &self,
        job: &SyncJob,
        observer: &dyn SyncObserver,
        cancel: &AtomicBool,
    ) -> Result<SyncSummary, SyncError> {
        let result = self.run_job(job, observer, cancel);
        if let Err(e) = &result {
            emit(observer, Level::ERROR, format!("Sync aborted: {}", e));
        }
        observer.notify(SyncEvent::Completed);
        result
    }

    fn run_job(
        &self,
        job: &SyncJob,
        observer: &dyn SyncObserver,
        cancel: &AtomicBool,
    ) -> Result<SyncSummary, SyncError> {
        // Everything here must pass before the catalog is touched
        let project = self
            .store
            .get_project(job.project_id)?
            .ok_or(SyncError::ProjectNotFound(job.project_id))?;
        if project.status == ProjectStatus::Archived {
            return Err(SyncError::ProjectArchived(project.id));
        }
        let base_dir = job
            .base_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&project.base_dir));
        if !base_dir.is_dir() {
            return Err(SyncError::BaseDirMissing(base_dir));
        }

        let mut summary = SyncSummary::default();
        match &job.files {
            Some(files) => self.sync_files(job, files, observer, cancel, &mut summary)?,
            None => self.sync_folder(job, &base_dir, observer, cancel, &mut summary)?,
        }

        emit(
            observer,
            Level::INFO,
            format!(
                "Sync of project '{}' {}: {} processed, {} inserted, {} failed, {} deleted",
                project.name,
                if summary.cancelled { "cancelled" } else { "finished" },
                summary.processed,
                summary.inserted,
                summary.failed,
                summary.deleted
            ),
        );
        Ok(summary)
    }

    fn sync_folder(
        &self,
        job: &SyncJob,
        base_dir: &Path,
        observer: &dyn SyncObserver,
        cancel: &AtomicBool,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let report = self.scanner.scan(base_dir);
        for message in &report.errors {
            emit(observer, Level::WARN, message.clone());
        }

        let known = if job.resync {
            let removed = self.store.delete_by_project(job.project_id)?;
            emit(
                observer,
                Level::INFO,
                format!("Resync: removed {} cataloged images", removed),
            );
            summary.deleted += removed;
            HashSet::new()
        } else {
            self.store.query_known_files(job.project_id)?
        };

        summary.total = report.files.len();
        observer.notify(SyncEvent::Total(summary.total));

        let mut scanned = HashSet::with_capacity(report.files.len());
        for path in &report.files {
            if cancel.load(Ordering::SeqCst) {
                summary.cancelled = true;
                emit(observer, Level::INFO, "Sync cancelled".to_string());
                break;
            }

            let key = path.to_string_lossy().to_string();
            if known.contains(&key) {
                debug!("Already cataloged: {}", key);
            } else {
                self.ingest(job.project_id, path, observer, summary);
            }
            scanned.insert(key);

            summary.processed += 1;
            observer.notify(SyncEvent::Processed(summary.processed));
        }

        if summary.cancelled || job.resync {
            return Ok(());
        }
        if !report.errors.is_empty() {
            emit(
                observer,
                Level::WARN,
                "Folder walk was incomplete; keeping cataloged files not seen".to_string(),
            );
            return Ok(());
        }

        let mut stale: Vec<String> = known.difference(&scanned).cloned().collect();
        stale.sort();
        summary.deleted += self.store.delete_paths(job.project_id, &stale)?;
        for path in &stale {
            emit(observer, Level::INFO, format!("Removed missing file: {}", path));
        }
        Ok(())
    }

    fn sync_files(
        &self,
        job: &SyncJob,
        files: &[PathBuf],
        observer: &dyn SyncObserver,
        cancel: &AtomicBool,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let known = self.store.query_known_files(job.project_id)?;

        summary.total = files.len();
        observer.notify(SyncEvent::Total(summary.total));

        for path in files {
            if cancel.load(Ordering::SeqCst) {
                summary.cancelled = true;
                emit(observer, Level::INFO, "Sync cancelled".to_string());
                break;
            }

            let path = std::path::absolute(path).unwrap_or_else(|_| path.clone());
            let key = path.to_string_lossy().to_string();
            if job.resync {
                summary.deleted += self.store.delete_by_path(job.project_id, &key)?;
                self.ingest(job.project_id, &path, observer, summary);
            } else if known.contains(&key) {
                debug!("Already cataloged: {}", key);
            } else {
                self.ingest(job.project_id, &path, observer, summary);
            }

            summary.processed += 1;
            observer.notify(SyncEvent::Processed(summary.processed));
        }
        Ok(())
    }

    /// Header, measurement, insert. Failures, panics included, are logged and
    /// counted; they never abort the job.
    fn ingest(
        &self,
        project_id: i64,
        path: &Path,
        observer: &dyn SyncObserver,
        summary: &mut SyncSummary,
    ) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.ingest_file(project_id, path, observer, summary)
        }));
        if let Err(payload) = outcome {
            summary.failed += 1;
            emit(
                observer,
                Level::ERROR,
                format!("Failed to ingest {}: {}", path.display(), panic_message(&*payload)),
            );
        }
    }

    fn ingest_file(
        &self,
        project_id: i64,
        path: &Path,
        observer: &dyn SyncObserver,
        summary: &mut SyncSummary,
    ) {
        let mut record = match self.extractor.extract(path, project_id) {
            Ok(record) => record,
            Err(e) => {
                summary.failed += 1;
                emit(
                    observer,
                    Level::ERROR,
                    format!("Failed to read header of {}: {:#}", path.display(), e),
                );
                return;
            }
        };

        record.measurement = match self.analyzer.analyze_file(path) {
            Ok(analysis) => {
                if let Some(reason) = analysis.skip {
                    emit(
                        observer,
                        Level::WARN,
                        format!("No star measurement for {}: {}", path.display(), reason),
                    );
                }
                analysis.measurement
            }
            Err(e) => {
                emit(
                    observer,
                    Level::WARN,
                    format!("Failed to measure {}: {:#}", path.display(), e),
                );
                FrameMeasurement::zero()
            }
        };
        if record.measurement.is_zero() {
            summary.unmeasured += 1;
        }

        match self.store.insert(&record) {
            Ok(_) => {
                summary.inserted += 1;
                debug!("Cataloged {}", record.file);
            }
            Err(e @ CatalogError::Duplicate { .. }) => {
                summary.duplicates += 1;
                emit(observer, Level::WARN, e.to_string());
            }
            Err(e) => {
                summary.failed += 1;
                emit(
                    observer,
                    Level::ERROR,
                    format!("Failed to store {}: {}", record.file, e),
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "panic"
    }
}

fn emit(observer: &dyn SyncObserver, level: Level, message: String) {
    if level == Level::ERROR {
        error!("{}", message);
    } else if level == Level::WARN {
        warn!("{}", message);
    } else if level == Level::INFO {
        info!("{}", message);
    } else {
        debug!("{}", message);
    }
    observer.notify(SyncEvent::Log { level, message });
}

/// Tracks which projects have a job in flight
#[derive(Debug, Clone, Default)]
pub struct SyncRegistry {
    running: Arc<Mutex<HashSet<i64>>>,
}

/// Held while a job runs; releases the project on drop
#[derive(Debug)]
pub struct SyncLease {
    project_id: i64,
    running: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for SyncLease {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.project_id);
    }
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, project_id: i64) -> Result<SyncLease, SyncError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(project_id) {
            return Err(SyncError::AlreadyRunning(project_id));
        }
        Ok(SyncLease {
            project_id,
            running: Arc::clone(&self.running),
        })
    }

    pub fn is_running(&self, project_id: i64) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&project_id)
    }

    /// Start a job on a worker thread that owns the synchronizer
    pub fn spawn<S, O>(
        &self,
        synchronizer: Synchronizer<S>,
        job: SyncJob,
        observer: O,
    ) -> Result<SyncHandle, SyncError>
    where
        S: CatalogStore + Send + 'static,
        O: SyncObserver + Sync + 'static,
    {
        let lease = match self.acquire(job.project_id) {
            Ok(lease) => lease,
            Err(e) => {
                emit(&observer, Level::ERROR, format!("Sync refused: {}", e));
                observer.notify(SyncEvent::Completed);
                return Err(e);
            }
        };

        let observer = Arc::new(observer);
        let worker_observer = Arc::clone(&observer);
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);
        let spawned = std::thread::Builder::new()
            .name(format!("sync-project-{}", job.project_id))
            .spawn(move || {
                let _lease = lease;
                let observer = &*worker_observer;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    synchronizer.run(&job, observer, &worker_cancel)
                }));
                outcome.unwrap_or_else(|payload| {
                    emit(
                        observer,
                        Level::ERROR,
                        format!("Sync worker panicked: {}", panic_message(&*payload)),
                    );
                    observer.notify(SyncEvent::Completed);
                    Err(SyncError::WorkerPanicked)
                })
            });

        match spawned {
            Ok(thread) => Ok(SyncHandle { cancel, thread }),
            Err(e) => {
                emit(&*observer, Level::ERROR, format!("Failed to start sync worker: {}", e));
                observer.notify(SyncEvent::Completed);
                Err(SyncError::Spawn(e))
            }
        }
    }
}

/// Running job started by [`SyncRegistry::spawn`]
pub struct SyncHandle {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<Result<SyncSummary, SyncError>>,
}

impl SyncHandle {
    /// Ask the worker to stop after the file in flight
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn join(self) -> Result<SyncSummary, SyncError> {
        self.thread.join().map_err(|_| SyncError::WorkerPanicked)?
    }
}
