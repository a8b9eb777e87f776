mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_core::{CanonicalStatus, Order, ProfitSnapshot};
use courier_storage::MemoryOrderStore;
use courier_sync::{PassOutcome, PassReport, PassStage, Reconciler, SyncPolicy};
use support::*;
use tokio::sync::Notify;

fn completed(outcome: PassOutcome) -> PassReport {
    match outcome {
        PassOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {other:?}"),
    }
}

#[tokio::test]
async fn first_dispatch_update_fills_courier_id_and_notifies_once() {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "a1",
        None,
        "101",
        CanonicalStatus::Active,
    )]));
    let courier = ScriptedCourier::with_remote(vec![remote("101", 3, "out for delivery")]);
    let sender = Arc::new(RecordingSender::default());
    let reconciler = reconciler(courier, store.clone(), sender.clone(), &policy());

    let report = completed(reconciler.run_pass().await);

    let order = store.order("a1").unwrap();
    assert_eq!(order.status, CanonicalStatus::InDelivery);
    assert_eq!(order.courier_order_id.as_deref(), Some("101"));
    assert_eq!(order.courier_status_code, Some(3));
    assert_eq!(report.updated, 1);
    assert_eq!(report.notifications_sent, 1);
    assert_eq!(sender.count(), 1);
}

#[tokio::test]
async fn repeated_observation_is_a_no_op() {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "b1",
        None,
        "202",
        CanonicalStatus::Active,
    )]));
    let courier = ScriptedCourier::with_remote(vec![remote("202", 3, "out for delivery")]);
    let sender = Arc::new(RecordingSender::default());
    let reconciler = reconciler(courier, store.clone(), sender.clone(), &policy());

    completed(reconciler.run_pass().await);
    let writes_after_first = store.update_calls();
    let second = completed(reconciler.run_pass().await);

    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped.unchanged, 1);
    assert_eq!(second.notifications_sent, 0);
    assert_eq!(store.update_calls(), writes_after_first);
    assert_eq!(sender.count(), 1);
}

#[tokio::test]
async fn returns_warehouse_closes_the_order_and_drops_it_from_later_passes() {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "c1",
        Some("230"),
        "230",
        CanonicalStatus::InDelivery,
    )]));
    let courier = ScriptedCourier::with_remote(vec![remote("230", 23, "sent to returns warehouse")]);
    let sender = Arc::new(RecordingSender::default());
    let reconciler = reconciler(courier, store.clone(), sender.clone(), &policy());

    let first = completed(reconciler.run_pass().await);
    assert_eq!(first.updated, 1);
    let status = store.order("c1").unwrap().status;
    assert_eq!(status, CanonicalStatus::Returned);
    assert!(status.is_terminal());

    let second = completed(reconciler.run_pass().await);
    assert_eq!(second.local_candidates, 0);
    assert_eq!(second.unmatched, 1);
    assert_eq!(second.updated, 0);
    assert_eq!(sender.count(), 1);
}

#[tokio::test]
async fn one_failing_write_does_not_block_the_rest_and_is_retried() {
    let orders = (0..10).map(|i| {
        local(
            &format!("d{i}"),
            Some(format!("D{i}").as_str()),
            &format!("D{i}"),
            CanonicalStatus::InDelivery,
        )
    });
    let store = Arc::new(MemoryOrderStore::with_orders(orders));
    store.fail_updates_for("d4");
    let courier = ScriptedCourier::with_remote((0..10).map(|i| remote(&format!("D{i}"), 4, "delivered")).collect());
    let sender = Arc::new(RecordingSender::default());
    let reconciler = reconciler(courier, store.clone(), sender.clone(), &policy());

    let first = completed(reconciler.run_pass().await);
    assert_eq!(first.updated, 9);
    assert_eq!(first.failed_updates, 1);
    assert_eq!(first.notifications_sent, 9);
    assert_eq!(store.order("d4").unwrap().status, CanonicalStatus::InDelivery);

    store.clear_update_failures();
    let second = completed(reconciler.run_pass().await);
    assert_eq!(second.updated, 1);
    assert_eq!(second.failed_updates, 0);
    assert_eq!(store.order("d4").unwrap().status, CanonicalStatus::Delivered);
    assert_eq!(sender.count(), 10);
}

#[tokio::test]
async fn ignored_codes_leave_orders_untouched() {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "i1",
        Some("I1"),
        "I1",
        CanonicalStatus::InDelivery,
    )]));
    let courier = ScriptedCourier::with_remote(vec![remote("I1", 5, "at governorate sorting")]);
    let sender = Arc::new(RecordingSender::default());
    let reconciler = reconciler(courier, store.clone(), sender.clone(), &policy());

    let report = completed(reconciler.run_pass().await);
    assert_eq!(report.ignored, 1);
    assert_eq!(report.updated, 0);
    assert_eq!(report.skipped.total(), 0);
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn recent_updates_and_regressions_are_skipped() {
    let mut recent = local("s1", Some("S1"), "S1", CanonicalStatus::InDelivery);
    recent.status_updated_at = Some(Utc::now() - chrono::Duration::seconds(30));
    let dispatched = local("s2", Some("S2"), "S2", CanonicalStatus::NoAnswer);
    let store = Arc::new(MemoryOrderStore::with_orders([recent, dispatched]));
    let courier = ScriptedCourier::with_remote(vec![
        remote("S1", 4, "delivered"),
        remote("S2", 1, "active"),
    ]);
    let policy = SyncPolicy {
        ignored_codes: vec![],
        ..policy()
    };
    let reconciler = reconciler(courier, store.clone(), Arc::new(RecordingSender::default()), &policy);

    let report = completed(reconciler.run_pass().await);
    assert_eq!(report.skipped.too_soon, 1);
    assert_eq!(report.skipped.would_regress, 1);
    assert_eq!(store.order("s2").unwrap().status, CanonicalStatus::NoAnswer);
    assert_eq!(reconciler.stats().orders_skipped, 2);
}

#[tokio::test]
async fn unmatched_and_duplicate_remote_rows_are_counted() {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "u1",
        Some("U1"),
        "U1",
        CanonicalStatus::InDelivery,
    )]));
    let courier = ScriptedCourier::with_remote(vec![
        remote("U1", 25, "no answer"),
        remote("U1", 25, "no answer"),
        remote("ZZ", 4, "delivered"),
    ]);
    let reconciler = reconciler(courier, store.clone(), Arc::new(RecordingSender::default()), &policy());

    let report = completed(reconciler.run_pass().await);
    assert_eq!(report.unmatched, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(store.update_calls(), 1);
}

#[tokio::test]
async fn remote_failure_aborts_without_writes() {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "f1",
        Some("F1"),
        "F1",
        CanonicalStatus::InDelivery,
    )]));
    let courier = ScriptedCourier::with_remote(vec![remote("F1", 4, "delivered")]);
    courier.fail_listing.store(true, Ordering::SeqCst);
    let reconciler = reconciler(courier, store.clone(), Arc::new(RecordingSender::default()), &policy());

    let outcome = reconciler.run_pass().await;
    assert!(matches!(outcome, PassOutcome::Failed { stage: PassStage::FetchingRemote, .. }));
    assert_eq!(store.update_calls(), 0);

    let stats = reconciler.stats();
    assert_eq!(stats.failed_passes, 1);
    assert_eq!(stats.total_passes, 1);
    assert!(stats.last_error.unwrap().starts_with("fetching-remote"));
}

#[tokio::test]
async fn local_failure_aborts_the_pass() {
    let store = Arc::new(MemoryOrderStore::new());
    store.fail_fetches(true);
    let courier = ScriptedCourier::with_remote(vec![remote("L1", 4, "delivered")]);
    let reconciler = reconciler(courier, store, Arc::new(RecordingSender::default()), &policy());

    assert!(matches!(
        reconciler.run_pass().await,
        PassOutcome::Failed { stage: PassStage::FetchingLocal, .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_trigger_is_dropped() {
    let store = Arc::new(MemoryOrderStore::new());
    let courier = ScriptedCourier::with_remote(vec![]);
    courier.hold_listing.store(true, Ordering::SeqCst);
    let reconciler = reconciler(courier.clone(), store, Arc::new(RecordingSender::default()), &policy());

    let running = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.run_pass().await })
    };
    courier.entered.notified().await;
    assert!(reconciler.is_syncing());
    assert_eq!(reconciler.run_pass().await, PassOutcome::Busy);

    courier.release.notify_one();
    assert!(matches!(running.await.unwrap(), PassOutcome::Completed(_)));

    let stats = reconciler.stats();
    assert_eq!(stats.busy_skips, 1);
    assert_eq!(stats.total_passes, 1);
    assert!(!stats.currently_syncing);
}

#[tokio::test]
async fn profit_interference_during_a_pass_is_reverted() {
    let order = local("p1", None, "P1", CanonicalStatus::Active);
    let phone = order.user_phone.clone().unwrap();
    let store = Arc::new(MemoryOrderStore::with_orders([order]));
    let before = ProfitSnapshot {
        achieved_profit: 4000.0,
        expected_profit: 1500.0,
    };
    store.set_profit(&phone, before);
    let hook_phone = phone.clone();
    store.on_status_update(move |_, profits| {
        if let Some(p) = profits.get_mut(&hook_phone) {
            p.achieved_profit += 1000.0;
        }
    });
    let courier = ScriptedCourier::with_remote(vec![remote("P1", 2, "received by courier")]);
    let reconciler = reconciler(courier, store.clone(), Arc::new(RecordingSender::default()), &policy());

    let report = completed(reconciler.run_pass().await);
    assert_eq!(report.updated, 1);
    assert_eq!(store.profit(&phone), Some(before));
    assert_eq!(report.profit_reverts, 1);
    assert_eq!(reconciler.stats().profit_reverts, 1);
}

#[tokio::test]
async fn disabled_guard_leaves_profit_to_the_listener() {
    let order = local("p2", None, "P2", CanonicalStatus::Active);
    let phone = order.user_phone.clone().unwrap();
    let store = Arc::new(MemoryOrderStore::with_orders([order]));
    store.set_profit(
        &phone,
        ProfitSnapshot {
            achieved_profit: 0.0,
            expected_profit: 0.0,
        },
    );
    store.on_status_update(|_, profits| {
        for p in profits.values_mut() {
            p.expected_profit = 99.0;
        }
    });
    let courier = ScriptedCourier::with_remote(vec![remote("P2", 3, "out for delivery")]);
    let policy = SyncPolicy {
        profit_guard_enabled: false,
        ..policy()
    };
    let reconciler = reconciler(courier, store.clone(), Arc::new(RecordingSender::default()), &policy);

    completed(reconciler.run_pass().await);
    assert_eq!(store.profit(&phone).unwrap().expected_profit, 99.0);
    assert_eq!(store.profit_writes(), 0);
}

#[tokio::test]
async fn missing_notification_columns_degrade_to_memory() {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "n1",
        Some("N1"),
        "N1",
        CanonicalStatus::InDelivery,
    )]));
    store.drop_notification_columns();
    let courier = ScriptedCourier::with_remote(vec![remote("N1", 25, "no answer")]);
    let sender = Arc::new(RecordingSender::default());
    let reconciler = reconciler(courier, store.clone(), sender.clone(), &policy());

    let report = completed(reconciler.run_pass().await);
    assert_eq!(report.updated, 1);
    assert_eq!(sender.count(), 1);
    assert!(!reconciler.gate().durable_writes_enabled());
    assert_eq!(
        reconciler.gate().memory_entry("n1").map(|e| e.last_notified_status),
        Some(CanonicalStatus::NoAnswer)
    );
}

#[tokio::test]
async fn orders_awaiting_hand_off_are_submitted_once() {
    let mut ready = Order::new("h1", CanonicalStatus::InDelivery);
    ready.delivery = Some(details());
    let incomplete = Order::new("h2", CanonicalStatus::InDelivery);
    let store = Arc::new(MemoryOrderStore::with_orders([ready, incomplete]));
    let courier = ScriptedCourier::with_remote(vec![]);
    let reconciler = reconciler(courier.clone(), store.clone(), Arc::new(RecordingSender::default()), &policy());

    let first = completed(reconciler.run_pass().await);
    assert_eq!(first.handoffs_attempted, 2);
    assert_eq!(first.handoffs_submitted, 1);
    assert_eq!(first.handoffs_failed, 1);
    assert_eq!(store.order("h1").unwrap().courier_order_id.as_deref(), Some("H-h1"));

    let second = completed(reconciler.run_pass().await);
    assert_eq!(second.handoffs_submitted, 0);
    assert_eq!(courier.created.lock().len(), 1);
    assert_eq!(reconciler.stats().handoffs_submitted, 1);
}

#[tokio::test]
async fn stats_accumulate_across_passes() {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "t1",
        Some("T1"),
        "T1",
        CanonicalStatus::InDelivery,
    )]));
    let courier = ScriptedCourier::with_remote(vec![remote("T1", 29, "postponed")]);
    let reconciler = reconciler(courier.clone(), store, Arc::new(RecordingSender::default()), &policy());

    completed(reconciler.run_pass().await);
    courier.set_remote(vec![]);
    completed(reconciler.run_pass().await);

    let stats = reconciler.stats();
    assert_eq!(stats.total_passes, 2);
    assert_eq!(stats.successful_passes, 2);
    assert_eq!(stats.orders_updated, 1);
    assert_eq!(stats.notifications_sent, 1);
    assert!(stats.last_sync_time.is_some());
    assert_eq!(stats.last_report.map(|r| r.remote_orders), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_profit_interference_is_reverted_before_the_pass_returns() {
    let order = local("p3", None, "P3", CanonicalStatus::Active);
    let phone = order.user_phone.clone().unwrap();
    let store = Arc::new(MemoryOrderStore::with_orders([order]));
    let before = ProfitSnapshot {
        achieved_profit: 10.0,
        expected_profit: 5.0,
    };
    store.set_profit(&phone, before);

    let written = Arc::new(Notify::new());
    let signal = Arc::clone(&written);
    store.on_status_update(move |_, _| signal.notify_one());
    let listener = {
        let store = Arc::clone(&store);
        let phone = phone.clone();
        tokio::spawn(async move {
            written.notified().await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            store.set_profit(
                &phone,
                ProfitSnapshot {
                    achieved_profit: 999.0,
                    expected_profit: 5.0,
                },
            );
        })
    };

    let courier = ScriptedCourier::with_remote(vec![remote("P3", 3, "out for delivery")]);
    let policy = SyncPolicy {
        profit_recheck_delay_ms: 300,
        ..policy()
    };
    let reconciler = reconciler(courier, store.clone(), Arc::new(RecordingSender::default()), &policy);

    let report = completed(reconciler.run_pass().await);
    listener.await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.profit_reverts, 1);
    assert_eq!(store.profit(&phone), Some(before));
    assert_eq!(reconciler.stats().profit_reverts, 1);
}

#[tokio::test]
async fn write_that_lands_after_its_timeout_still_notifies_once() {
    let store = Arc::new(MemoryOrderStore::with_orders([local(
        "w1",
        Some("W1"),
        "W1",
        CanonicalStatus::InDelivery,
    )]));
    store.delay_update_acks(Some(Duration::from_millis(200)));
    let courier = ScriptedCourier::with_remote(vec![remote("W1", 25, "no answer")]);
    let sender = Arc::new(RecordingSender::default());
    let reconciler = Reconciler::new(
        courier,
        store.clone(),
        sender.clone(),
        &policy(),
        Duration::from_millis(50),
    );

    let first = completed(reconciler.run_pass().await);
    assert_eq!(first.failed_updates, 1);
    assert_eq!(first.notifications_sent, 0);
    assert_eq!(store.order("w1").unwrap().status, CanonicalStatus::NoAnswer);

    store.delay_update_acks(None);
    let second = completed(reconciler.run_pass().await);
    assert_eq!(second.skipped.unchanged, 1);
    assert_eq!(second.notifications_sent, 1);
    assert_eq!(sender.count(), 1);

    let third = completed(reconciler.run_pass().await);
    assert_eq!(third.notifications_sent, 0);
    assert_eq!(sender.count(), 1);
}
