//! End-to-end sync scenarios over real FITS files on disk

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};
use tracing::Level;

use crate::config::CatalogConfig;
use crate::db::{CatalogError, CatalogStore, Database};
use crate::models::{CatalogRecord, Project, ProjectStatus};
use crate::sync::{SyncError, SyncEvent, SyncJob, SyncObserver, SyncRegistry, Synchronizer};
use crate::test_utils::{write_fits, write_star_frame};

fn setup() -> (TempDir, Synchronizer<Database>, i64) {
    let dir = tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    let project_id = db
        .create_project("Test", &dir.path().to_string_lossy())
        .unwrap();
    let sync = Synchronizer::from_config(db, &CatalogConfig::default());
    (dir, sync, project_id)
}

fn write_light(path: &Path, seed: u64, filter: &str) {
    let filter = format!("'{}'", filter);
    write_star_frame(
        path,
        seed,
        &[
            ("OBJECT", "'M 42'"),
            ("DATE-OBS", "'2024-01-05T21:00:00'"),
            ("FILTER", &filter),
            ("EXPOSURE", "120.0"),
            ("OBJCTRA", "'05 35 17.3'"),
            ("OBJCTDEC", "'-05 23 28'"),
            ("SITELAT", "40.0"),
            ("SITELONG", "-105.0"),
        ],
    )
    .unwrap();
}

fn run(sync: &Synchronizer<Database>, job: &SyncJob) -> (Result<crate::sync::SyncSummary, SyncError>, Vec<SyncEvent>) {
    let (tx, rx) = mpsc::channel();
    let result = sync.run(job, &tx, &AtomicBool::new(false));
    (result, rx.try_iter().collect())
}

fn files_of(sync: &Synchronizer<Database>, project_id: i64) -> HashSet<String> {
    sync.store().query_known_files(project_id).unwrap()
}

fn path_key(path: PathBuf) -> String {
    std::path::absolute(path).unwrap().to_string_lossy().to_string()
}

fn processed(events: &[SyncEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Processed(n) => Some(*n),
            _ => None,
        })
        .collect()
}

fn error_logs(events: &[SyncEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Log { level, message } if *level == Level::ERROR => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

fn assert_single_completed_last(events: &[SyncEvent]) {
    let completed = events.iter().filter(|e| **e == SyncEvent::Completed).count();
    assert_eq!(completed, 1);
    assert_eq!(events.last(), Some(&SyncEvent::Completed));
}

#[test]
fn test_end_to_end_with_corrupt_file() {
    let (dir, sync, project_id) = setup();
    write_light(&dir.path().join("a.fits"), 1, "Lum");
    write_light(&dir.path().join("b.fits"), 2, "ha");
    std::fs::write(dir.path().join("corrupt.fits"), b"definitely not a FITS file").unwrap();

    let (result, events) = run(&sync, &SyncJob::new(project_id));
    let summary = result.unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.failed, 1);

    assert_eq!(events.first(), Some(&SyncEvent::Total(3)));
    assert_eq!(processed(&events), vec![1, 2, 3]);
    let errors = error_logs(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("corrupt.fits"));
    assert_single_completed_last(&events);

    let records = sync.store().records_by_project(project_id).unwrap();
    assert_eq!(records.len(), 2);
    let filters: HashSet<&str> = records.iter().filter_map(|r| r.filter.as_deref()).collect();
    assert_eq!(filters, HashSet::from(["L", "Ha"]));

    for record in &records {
        assert_eq!(record.object.as_deref(), Some("M 42"));
        assert_eq!(record.exposure, Some(120.0));
        assert!(record.size_mb > 0.0);
        assert!(record.measurement.fwhm > 2.0 && record.measurement.fwhm < 4.0);
        assert!(record.measurement.median > 990.0 && record.measurement.median < 1010.0);
    }
}

#[test]
fn test_incremental_sync_matches_folder() {
    let (dir, sync, project_id) = setup();
    let a = dir.path().join("a.fits");
    let b = dir.path().join("b.fits");
    let c = dir.path().join("night2/c.fits");
    write_light(&a, 1, "R");
    write_light(&b, 2, "G");

    run(&sync, &SyncJob::new(project_id)).0.unwrap();
    let before: Vec<CatalogRecord> = sync.store().records_by_project(project_id).unwrap();
    assert_eq!(before.len(), 2);

    std::fs::remove_file(&b).unwrap();
    std::fs::create_dir_all(c.parent().unwrap()).unwrap();
    write_light(&c, 3, "B");

    let (result, events) = run(&sync, &SyncJob::new(project_id));
    let summary = result.unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(processed(&events), vec![1, 2]);

    assert_eq!(
        files_of(&sync, project_id),
        HashSet::from([path_key(a.clone()), path_key(c)])
    );

    // Files seen before are left untouched
    let after = sync.store().records_by_project(project_id).unwrap();
    let a_key = path_key(a);
    let old = before.iter().find(|r| r.file == a_key).unwrap();
    let new = after.iter().find(|r| r.file == a_key).unwrap();
    assert_eq!(old, new);
}

#[test]
fn test_resync_is_idempotent() {
    let (dir, sync, project_id) = setup();
    write_light(&dir.path().join("a.fits"), 1, "Ha");
    write_light(&dir.path().join("b.fits"), 2, "Oiii");

    let job = SyncJob::new(project_id).with_resync(true);
    let first = run(&sync, &job).0.unwrap();
    let records_first = sync.store().records_by_project(project_id).unwrap();

    let second = run(&sync, &job).0.unwrap();
    let records_second = sync.store().records_by_project(project_id).unwrap();

    assert_eq!(first.inserted, 2);
    assert_eq!(second.inserted, 2);
    assert_eq!(second.deleted, 2);
    assert_eq!(records_first, records_second);

    // Plain sync of an unchanged folder changes nothing either
    let third = run(&sync, &SyncJob::new(project_id)).0.unwrap();
    assert_eq!(third.inserted, 0);
    assert_eq!(third.deleted, 0);
    assert_eq!(sync.store().records_by_project(project_id).unwrap(), records_first);
}

struct CancelAfterFirstFile {
    cancel: Arc<AtomicBool>,
    events: Mutex<Vec<SyncEvent>>,
}

impl SyncObserver for CancelAfterFirstFile {
    fn notify(&self, event: SyncEvent) {
        if event == SyncEvent::Processed(1) {
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.events.lock().unwrap().push(event);
    }
}

#[test]
fn test_cancellation_stops_between_files() {
    let (dir, sync, project_id) = setup();
    for (i, name) in ["a.fits", "b.fits", "c.fits"].iter().enumerate() {
        write_light(&dir.path().join(name), i as u64, "L");
    }
    let ghost = CatalogRecord {
        file: "/nowhere/ghost.fits".to_string(),
        project_id,
        ..Default::default()
    };
    sync.store().insert(&ghost).unwrap();

    let cancel = Arc::new(AtomicBool::new(false));
    let observer = CancelAfterFirstFile {
        cancel: Arc::clone(&cancel),
        events: Mutex::new(Vec::new()),
    };
    let summary = sync.run(&SyncJob::new(project_id), &observer, &cancel).unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.deleted, 0);

    let events = observer.events.into_inner().unwrap();
    assert_eq!(processed(&events), vec![1]);
    assert_single_completed_last(&events);

    // No delete pass after a cancelled run
    assert!(files_of(&sync, project_id).contains("/nowhere/ghost.fits"));
}

#[test]
fn test_explicit_file_list() {
    let (dir, sync, project_id) = setup();
    let a = dir.path().join("a.fits");
    let b = dir.path().join("b.fits");
    write_light(&a, 1, "R");
    write_light(&b, 2, "G");

    let ghost = CatalogRecord {
        file: "/nowhere/ghost.fits".to_string(),
        project_id,
        ..Default::default()
    };
    sync.store().insert(&ghost).unwrap();

    let (result, events) = run(&sync, &SyncJob::new(project_id).with_files(vec![a.clone()]));
    let summary = result.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.inserted, 1);
    assert_eq!(events.first(), Some(&SyncEvent::Total(1)));

    let known = files_of(&sync, project_id);
    assert!(known.contains(&path_key(a.clone())));
    assert!(!known.contains(&path_key(b)));
    assert!(known.contains("/nowhere/ghost.fits"));

    // Known files are skipped unless resync is requested
    let again = run(&sync, &SyncJob::new(project_id).with_files(vec![a.clone()])).0.unwrap();
    assert_eq!(again.inserted, 0);

    write_light(&a, 1, "Sii");
    let reingest = run(
        &sync,
        &SyncJob::new(project_id).with_resync(true).with_files(vec![a.clone()]),
    )
    .0
    .unwrap();
    assert_eq!(reingest.deleted, 1);
    assert_eq!(reingest.inserted, 1);

    let a_key = path_key(a);
    let records = sync.store().records_by_project(project_id).unwrap();
    let record = records.iter().find(|r| r.file == a_key).unwrap();
    assert_eq!(record.filter.as_deref(), Some("Sii"));
    assert_eq!(sync.store().count_by_project(project_id).unwrap(), 2);
}

#[test]
fn test_archived_project_is_refused_before_mutation() {
    let (dir, sync, project_id) = setup();
    write_light(&dir.path().join("a.fits"), 1, "L");
    run(&sync, &SyncJob::new(project_id)).0.unwrap();
    sync.store()
        .set_project_status(project_id, ProjectStatus::Archived)
        .unwrap();

    let (result, events) = run(&sync, &SyncJob::new(project_id).with_resync(true));
    assert!(matches!(result, Err(SyncError::ProjectArchived(id)) if id == project_id));
    assert_eq!(error_logs(&events).len(), 1);
    assert_eq!(events.len(), 2);
    assert_single_completed_last(&events);
    assert_eq!(sync.store().count_by_project(project_id).unwrap(), 1);
}

#[test]
fn test_missing_project_and_base_dir_are_fatal() {
    let (dir, sync, project_id) = setup();
    write_light(&dir.path().join("a.fits"), 1, "L");
    run(&sync, &SyncJob::new(project_id)).0.unwrap();

    let (result, events) = run(&sync, &SyncJob::new(project_id + 42));
    assert!(matches!(result, Err(SyncError::ProjectNotFound(_))));
    assert_single_completed_last(&events);

    let (result, events) = run(
        &sync,
        &SyncJob::new(project_id)
            .with_resync(true)
            .with_base_dir(dir.path().join("gone")),
    );
    assert!(matches!(result, Err(SyncError::BaseDirMissing(_))));
    assert_eq!(error_logs(&events).len(), 1);
    assert_single_completed_last(&events);
    assert_eq!(sync.store().count_by_project(project_id).unwrap(), 1);
}

#[test]
fn test_registry_refuses_concurrent_job() {
    let (dir, sync, project_id) = setup();
    write_light(&dir.path().join("a.fits"), 1, "L");

    let registry = SyncRegistry::new();
    let lease = registry.acquire(project_id).unwrap();
    assert!(registry.is_running(project_id));

    let (tx, rx) = mpsc::channel();
    let refused = registry.spawn(sync, SyncJob::new(project_id), tx);
    let Err(SyncError::AlreadyRunning(id)) = refused else {
        panic!("expected the second job to be refused");
    };
    assert_eq!(id, project_id);
    let events: Vec<SyncEvent> = rx.try_iter().collect();
    assert_eq!(error_logs(&events).len(), 1);
    assert_single_completed_last(&events);

    drop(lease);
    assert!(!registry.is_running(project_id));

    let db = Database::open_in_memory().unwrap();
    let project_id = db.create_project("Again", &dir.path().to_string_lossy()).unwrap();
    let sync = Synchronizer::from_config(db, &CatalogConfig::default());

    let (tx, rx) = mpsc::channel();
    let handle = registry.spawn(sync, SyncJob::new(project_id), tx).unwrap();
    let events: Vec<SyncEvent> = rx.iter().collect();
    let summary = handle.join().unwrap();

    assert_eq!(summary.inserted, 1);
    assert_single_completed_last(&events);
    assert!(!registry.is_running(project_id));
}

#[test]
fn test_empty_image_does_not_stop_the_job() {
    let dir = tempdir().unwrap();
    let catalog = dir.path().join("catalog.sqlite");
    let db = Database::open(&catalog).unwrap();
    let project_id = db
        .create_project("Empty", &dir.path().to_string_lossy())
        .unwrap();
    let sync = Synchronizer::from_config(db, &CatalogConfig::default());

    write_fits(&dir.path().join("a_empty.fits"), 0, 0, &[], &[("OBJECT", "'Empty'")]).unwrap();
    let b = dir.path().join("b.fits");
    write_light(&b, 2, "L");

    let registry = SyncRegistry::new();
    let (tx, rx) = mpsc::channel();
    let handle = registry.spawn(sync, SyncJob::new(project_id), tx).unwrap();
    let events: Vec<SyncEvent> = rx.iter().collect();
    let summary = handle.join().unwrap();

    assert_eq!(summary.processed, 2);
    assert_eq!(summary.inserted + summary.failed, 2);
    assert_eq!(processed(&events), vec![1, 2]);
    assert_single_completed_last(&events);
    assert!(!registry.is_running(project_id));

    let reopened = Database::open(&catalog).unwrap();
    assert!(reopened.query_known_files(project_id).unwrap().contains(&path_key(b)));
}

/// Catalog that blows up on a chosen file or on every project lookup
struct FaultyStore {
    inner: Database,
    poisoned_file: &'static str,
    fail_lookup: bool,
}

impl CatalogStore for FaultyStore {
    fn insert(&self, record: &CatalogRecord) -> Result<i64, CatalogError> {
        if record.file.ends_with(self.poisoned_file) {
            panic!("cannot store {}", record.file);
        }
        self.inner.insert(record)
    }

    fn query_known_files(&self, project_id: i64) -> Result<HashSet<String>, CatalogError> {
        self.inner.query_known_files(project_id)
    }

    fn delete_by_project(&self, project_id: i64) -> Result<usize, CatalogError> {
        self.inner.delete_by_project(project_id)
    }

    fn delete_by_path(&self, project_id: i64, path: &str) -> Result<usize, CatalogError> {
        self.inner.delete_by_path(project_id, path)
    }

    fn delete_paths(&self, project_id: i64, paths: &[String]) -> Result<usize, CatalogError> {
        self.inner.delete_paths(project_id, paths)
    }

    fn count_by_project(&self, project_id: i64) -> Result<usize, CatalogError> {
        self.inner.count_by_project(project_id)
    }

    fn get_project(&self, project_id: i64) -> Result<Option<Project>, CatalogError> {
        if self.fail_lookup {
            panic!("project lookup failed");
        }
        self.inner.get_project(project_id)
    }
}

fn faulty_setup(fail_lookup: bool) -> (TempDir, Synchronizer<FaultyStore>, i64) {
    let dir = tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    let project_id = db
        .create_project("Faulty", &dir.path().to_string_lossy())
        .unwrap();
    let store = FaultyStore {
        inner: db,
        poisoned_file: "b_poison.fits",
        fail_lookup,
    };
    let sync = Synchronizer::from_config(store, &CatalogConfig::default());
    (dir, sync, project_id)
}

#[test]
fn test_panicking_file_is_counted_as_failed() {
    let (dir, sync, project_id) = faulty_setup(false);
    for (i, name) in ["a.fits", "b_poison.fits", "c.fits"].iter().enumerate() {
        write_light(&dir.path().join(name), i as u64, "L");
    }

    let registry = SyncRegistry::new();
    let (tx, rx) = mpsc::channel();
    let handle = registry.spawn(sync, SyncJob::new(project_id), tx).unwrap();
    let events: Vec<SyncEvent> = rx.iter().collect();
    let summary = handle.join().unwrap();

    assert_eq!(summary.processed, 3);
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(processed(&events), vec![1, 2, 3]);

    let errors = error_logs(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("b_poison.fits"));
    assert!(errors[0].contains("cannot store"));
    assert_single_completed_last(&events);
}

#[test]
fn test_worker_panic_still_completes() {
    let (dir, sync, project_id) = faulty_setup(true);
    write_light(&dir.path().join("a.fits"), 1, "L");

    let registry = SyncRegistry::new();
    let (tx, rx) = mpsc::channel();
    let handle = registry.spawn(sync, SyncJob::new(project_id), tx).unwrap();
    let events: Vec<SyncEvent> = rx.iter().collect();

    assert!(matches!(handle.join(), Err(SyncError::WorkerPanicked)));
    let errors = error_logs(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("project lookup failed"));
    assert_single_completed_last(&events);
    assert!(!registry.is_running(project_id));
}

/// Holds the worker at `Total` until the test lets it go
struct GatedObserver {
    gate: Mutex<Receiver<()>>,
    events: Sender<SyncEvent>,
}

impl SyncObserver for GatedObserver {
    fn notify(&self, event: SyncEvent) {
        let at_total = matches!(event, SyncEvent::Total(_));
        let _ = self.events.send(event);
        if at_total {
            let _ = self.gate.lock().unwrap().recv();
        }
    }
}

#[test]
fn test_handle_cancel_before_first_file() {
    let (dir, sync, project_id) = setup();
    write_light(&dir.path().join("a.fits"), 1, "L");
    write_light(&dir.path().join("b.fits"), 2, "L");

    let (gate_tx, gate_rx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();
    let observer = GatedObserver {
        gate: Mutex::new(gate_rx),
        events: tx,
    };

    let registry = SyncRegistry::new();
    let handle = registry.spawn(sync, SyncJob::new(project_id), observer).unwrap();
    handle.cancel();
    gate_tx.send(()).unwrap();

    let events: Vec<SyncEvent> = rx.iter().collect();
    let summary = handle.join().unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.inserted, 0);
    assert!(processed(&events).is_empty());
    assert_single_completed_last(&events);
}
