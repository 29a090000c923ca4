//! Runs against the file-backed store

use crate::common::*;
use pvoutput_backfill::cli::purge::purge_system;
use pvoutput_backfill::downloader::{DownloadOrchestrator, EntityJob, EntityStatus, QuotaConfig};
use pvoutput_backfill::fetcher::{FetchOutcome, Payload};
use pvoutput_backfill::resume::{FileStore, ResumeLock, ResumeState};
use pvoutput_backfill::shutdown::ShutdownCoordinator;
use pvoutput_backfill::{DateSpan, SystemId};
use tempfile::TempDir;

const SYS: SystemId = SystemId::new(6112);

fn file_orchestrator(
    provider: ScriptedProvider,
    store: FileStore,
    clock: ManualClock,
) -> DownloadOrchestrator<ScriptedProvider, FileStore, ManualClock> {
    DownloadOrchestrator::new(provider, store, clock, QuotaConfig::new(60))
        .with_shutdown(ShutdownCoordinator::shared())
}

/// Data on every date except the 3rd
fn gap_on_third() -> ScriptedProvider {
    ScriptedProvider::new(|unit, _| {
        if unit.span().is_some_and(|s| s.start() == d(3)) {
            FetchOutcome::Empty
        } else {
            rows_for(unit)
        }
    })
}

#[tokio::test]
async fn test_run_writes_unit_files_and_state() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::new(dir.path().join("data"), dir.path().join(".resume"));
    let mut orch = file_orchestrator(gap_on_third(), store.clone(), ManualClock::new());

    let report = orch.run(vec![EntityJob::new(SYS, span(1, 4))]).await.unwrap();
    assert_eq!(report.entity(SYS).unwrap().status, EntityStatus::Completed);

    for day in [1, 2, 4] {
        let path = store.unit_path(SYS, DateSpan::single(d(day)));
        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("datetime,"));
        assert_eq!(lines.count(), 1, "one row expected in {}", path.display());
    }
    assert!(!store.unit_path(SYS, DateSpan::single(d(3))).exists());

    let state = ResumeState::load(&store.state_path(SYS)).unwrap();
    assert_eq!(state.cursor(), Some(d(4)));
    assert_eq!(state.missing_ranges().len(), 1);
    assert_eq!(state.missing_ranges()[0].span(), Some(DateSpan::single(d(3))));
    assert!(state.verify().is_ok());
}

#[tokio::test]
async fn test_second_run_resumes_from_disk() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::new(dir.path().join("data"), dir.path().join(".resume"));

    let mut first = file_orchestrator(gap_on_third(), store.clone(), ManualClock::new());
    first.run(vec![EntityJob::new(SYS, span(1, 4))]).await.unwrap();

    // Extending the span only requests the new dates.
    let provider = ScriptedProvider::always_data();
    let log = provider.call_log();
    let mut second = file_orchestrator(provider, store.clone(), ManualClock::new());
    let report = second.run(vec![EntityJob::new(SYS, span(1, 6))]).await.unwrap();

    let requested: Vec<_> = log.lock().unwrap().iter().filter_map(|u| u.span()).collect();
    assert_eq!(requested, vec![DateSpan::single(d(5)), DateSpan::single(d(6))]);
    assert_eq!(report.entity(SYS).unwrap().cursor, Some(d(6)));
}

#[tokio::test]
async fn test_metadata_file_written_once() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::new(dir.path().join("data"), dir.path().join(".resume"));
    let provider = ScriptedProvider::new(|unit, _| match unit.span() {
        Some(_) => rows_for(unit),
        None => FetchOutcome::Data(Payload::Metadata(metadata_for(unit.system_id()))),
    });
    let mut orch =
        file_orchestrator(provider, store.clone(), ManualClock::new()).with_metadata(true);

    orch.run(vec![EntityJob::new(SYS, span(1, 1))]).await.unwrap();

    let content = std::fs::read_to_string(store.metadata_path(SYS)).unwrap();
    assert!(content.contains("System 6112"));
    assert!(ResumeState::load(&store.state_path(SYS)).unwrap().metadata_fetched());
}

#[test]
fn test_resume_lock_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let held = ResumeLock::try_acquire(dir.path()).unwrap();
    assert!(ResumeLock::try_acquire(dir.path()).is_err());
    drop(held);
    assert!(ResumeLock::try_acquire(dir.path()).is_ok());
}

#[tokio::test]
async fn test_purge_makes_dates_requestable_again() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::new(dir.path().join("data"), dir.path().join(".resume"));

    let mut first = file_orchestrator(gap_on_third(), store.clone(), ManualClock::new());
    first.run(vec![EntityJob::new(SYS, span(1, 4))]).await.unwrap();

    let outcome = purge_system(&store, SYS, span(3, 3)).unwrap();
    assert_eq!(outcome.removed, 1);

    let state = ResumeState::load(&store.state_path(SYS)).unwrap();
    assert!(state.missing_ranges().is_empty());
    assert_eq!(state.cursor(), Some(d(2)));

    let provider = ScriptedProvider::always_data();
    let log = provider.call_log();
    let mut second = file_orchestrator(provider, store.clone(), ManualClock::new());
    second.run(vec![EntityJob::new(SYS, span(1, 4))]).await.unwrap();

    let requested: Vec<_> = log.lock().unwrap().iter().filter_map(|u| u.span()).collect();
    assert_eq!(requested, vec![DateSpan::single(d(3)), DateSpan::single(d(4))]);
    assert!(store.unit_path(SYS, DateSpan::single(d(3))).exists());
}

#[test]
fn test_purge_without_state_is_noop() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::new(dir.path().join("data"), dir.path().join(".resume"));
    let outcome = purge_system(&store, SystemId::new(1), span(1, 2)).unwrap();
    assert_eq!(outcome.removed, 0);
    assert!(!store.state_path(SystemId::new(1)).exists());
}
