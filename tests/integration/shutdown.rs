use std::time::Duration;

use crate::common::*;
use pvoutput_backfill::downloader::{
    DownloadOrchestrator, EntityJob, EntityStatus, QuotaConfig, SystemClock,
};
use pvoutput_backfill::fetcher::FetchOutcome;
use pvoutput_backfill::shutdown::ShutdownCoordinator;
use pvoutput_backfill::SystemId;

#[tokio::test]
async fn shutdown_notifies_waiters() {
    let shutdown = ShutdownCoordinator::shared();
    let waiter = {
        let handle = shutdown.clone();
        tokio::spawn(async move {
            handle.wait_for_shutdown().await;
            true
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.request_shutdown();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok());
}

/// A request made before anyone waits must not be lost.
#[tokio::test]
async fn shutdown_requested_before_wait_does_not_deadlock() {
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let handle = shutdown.clone();
    let waiter = tokio::spawn(async move {
        handle.wait_for_shutdown().await;
        true
    });

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok(), "wait_for_shutdown() blocked after shutdown was requested");
}

#[tokio::test]
async fn shutdown_concurrent_waiters_all_notified() {
    let shutdown = ShutdownCoordinator::shared();

    let mut waiters = Vec::new();
    for _ in 0..10 {
        let handle = shutdown.clone();
        waiters.push(tokio::spawn(async move {
            handle.wait_for_shutdown().await;
        }));
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.request_shutdown();
    // Repeated requests are harmless
    shutdown.request_shutdown();

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(result.is_ok(), "A waiter was not notified of shutdown");
    }
}

/// Stopping mid-run keeps the committed prefix and cancels the rest.
#[tokio::test]
async fn shutdown_mid_run_persists_committed_units() {
    let store = MemoryStore::new();
    let shutdown = ShutdownCoordinator::shared();
    let provider = ScriptedProvider::always_data().shutdown_after(2, shutdown.clone());
    let (orch, _) = orchestrator(provider, store.clone(), ManualClock::new(), 60);
    let mut orch = orch.with_shutdown(shutdown);

    let sys = SystemId::new(6112);
    let report = orch.run(vec![EntityJob::new(sys, span(1, 5))]).await.unwrap();

    let entity = report.entity(sys).unwrap();
    assert_eq!(entity.status, EntityStatus::Cancelled);
    // The unit in flight when shutdown arrived is still committed.
    assert_eq!(entity.cursor, Some(d(2)));
    assert_eq!(store.state(sys).unwrap().cursor(), Some(d(2)));
    assert_eq!(store.dates_with_rows(sys), vec![d(1), d(2)]);
}

/// A quota wait in progress is abandoned on shutdown instead of sleeping it out.
#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_quota_wait() {
    let store = MemoryStore::new();
    let provider = ScriptedProvider::new(|_, _| FetchOutcome::RateLimited { reset_at: None });
    let shutdown = ShutdownCoordinator::shared();
    let mut orch =
        DownloadOrchestrator::new(provider, store.clone(), SystemClock, QuotaConfig::new(60))
            .with_shutdown(shutdown.clone());

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.request_shutdown();
    });

    let sys = SystemId::new(4232);
    let report = tokio::time::timeout(
        Duration::from_secs(120),
        orch.run(vec![EntityJob::new(sys, span(1, 3))]),
    )
    .await
    .expect("run should stop once shutdown is requested")
    .unwrap();
    stopper.await.unwrap();

    let entity = report.entity(sys).unwrap();
    assert_eq!(entity.status, EntityStatus::Cancelled);
    assert_eq!(entity.cursor, None);
    assert!(store
        .state(sys)
        .map_or(true, |state| state.missing_ranges().is_empty() && state.cursor().is_none()));
}
