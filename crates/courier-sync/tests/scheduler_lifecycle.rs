mod support;

use std::sync::Arc;
use std::time::Duration;

use courier_core::CanonicalStatus;
use courier_storage::MemoryOrderStore;
use courier_sync::{PassOutcome, SchedulerConfig, SchedulerError, SyncScheduler};
use support::*;

fn scheduler(run_on_start: bool) -> (SyncScheduler, Arc<MemoryOrderStore>) {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "s1",
        Some("S1"),
        "S1",
        CanonicalStatus::InDelivery,
    )]));
    let courier = ScriptedCourier::with_remote(vec![remote("S1", 4, "delivered")]);
    let reconciler = reconciler(courier, store.clone(), Arc::new(RecordingSender::default()), &policy());
    let scheduler = SyncScheduler::new(
        reconciler,
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            run_on_start,
            shutdown_grace: Duration::from_secs(1),
        },
    );
    (scheduler, store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_runs_an_initial_pass_and_stop_is_clean() {
    let (scheduler, store) = scheduler(true);
    scheduler.start().await.expect("start");
    assert!(scheduler.is_running().await);
    assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

    let mut waited = Duration::ZERO;
    while scheduler.stats().total_passes == 0 && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    let stats = scheduler.stats();
    assert!(stats.running);
    assert!(stats.next_run_at.is_some());
    assert!(stats.successful_passes >= 1);
    assert_eq!(store.order("s1").unwrap().status, CanonicalStatus::Delivered);

    scheduler.stop().await.expect("stop");
    assert!(!scheduler.is_running().await);
    assert!(!scheduler.stats().running);
    assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn force_run_works_without_the_schedule() {
    let (scheduler, store) = scheduler(false);
    assert!(!scheduler.is_running().await);

    let outcome = scheduler.force_run().await;
    let report = outcome.report().expect("completed pass");
    assert_eq!(report.updated, 1);
    assert_eq!(store.order("s1").unwrap().status, CanonicalStatus::Delivered);
    assert!(matches!(scheduler.force_run().await, PassOutcome::Completed(_)));
    assert_eq!(scheduler.stats().total_passes, 2);
}
