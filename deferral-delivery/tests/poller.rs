#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use deferral_common::headers;
use deferral_delivery::{
    CriticalError, DelayedDeliveryConfig, Dispatcher, DueDelayedMessagePoller, MessageDispatcher,
};
use deferral_store::{DelayedMessageStore, StoreOperation, TestDelayedMessageStore};
use pretty_assertions::assert_eq;
use support::{
    ERROR_QUEUE, RecordingCriticalError, RecordingDispatcher, config, delayed, store_committed,
};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    store: TestDelayedMessageStore,
    dispatcher: Arc<RecordingDispatcher>,
    critical: Arc<RecordingCriticalError>,
    poller: DueDelayedMessagePoller,
    cancel: CancellationToken,
}

impl Harness {
    fn new(config: &DelayedDeliveryConfig) -> Self {
        let store = TestDelayedMessageStore::new();
        let dispatcher = RecordingDispatcher::new();
        let critical = RecordingCriticalError::new();

        let poller = DueDelayedMessagePoller::new(
            config,
            Arc::new(store.clone()) as Arc<dyn DelayedMessageStore>,
            MessageDispatcher::new(
                Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
                ERROR_QUEUE,
                config.timeouts_queue(),
            ),
            &(Arc::clone(&critical) as Arc<dyn CriticalError>),
        );

        Self {
            store,
            dispatcher,
            critical,
            poller,
            cancel: CancellationToken::new(),
        }
    }

    fn start(&self) {
        self.poller.start(&self.cancel).expect("poller starts");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_due_entry_dispatched_and_removed() {
    let harness = Harness::new(&config());
    store_committed(&harness.store, delayed("m-1", "orders", Utc::now())).await;
    harness.start();

    let sent = harness.dispatcher.wait_for("orders", 1, WAIT).await;
    assert_eq!(sent[0].message.message_id, "m-1");
    assert_eq!(sent[0].message.body, b"payload of m-1");
    assert_eq!(
        sent[0].message.headers.get("Content-Type").map(String::as_str),
        Some("text/plain")
    );
    assert!(sent[0].transaction.store_transaction().is_some());

    harness.store.wait_until_empty(WAIT).await.expect("entry removed");
    harness.poller.stop().await;
    assert!(!harness.poller.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_entry_forwarded_after_retry_budget_exhausted() {
    let mut config = config();
    config.number_of_retries = 2;
    let harness = Harness::new(&config);
    harness.dispatcher.fail("orders", 3);

    store_committed(&harness.store, delayed("m-1", "orders", Utc::now())).await;
    harness.start();

    let forwarded = harness.dispatcher.wait_for(ERROR_QUEUE, 1, WAIT).await;
    harness.store.wait_until_empty(WAIT).await.expect("entry removed");
    harness.poller.stop().await;

    assert_eq!(harness.dispatcher.attempts("orders"), 3);
    assert!(harness.dispatcher.sent_to("orders").is_empty());

    let message = &forwarded[0].message;
    assert_eq!(message.message_id, "m-1");
    assert_eq!(message.body, b"payload of m-1");
    assert_eq!(
        message.headers.get(headers::FAILED_QUEUE).map(String::as_str),
        Some("Sales.timeouts")
    );
    assert_eq!(
        message.headers.get(headers::EXCEPTION_TYPE).map(String::as_str),
        Some("Dispatch.Transport")
    );
    assert_eq!(
        message.headers.get(headers::EXCEPTION_SOURCE).map(String::as_str),
        Some("DueDelayedMessagePoller")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_entry_within_retry_budget_is_eventually_delivered() {
    let mut config = config();
    config.number_of_retries = 2;
    let harness = Harness::new(&config);
    harness.dispatcher.fail("orders", 2);

    store_committed(&harness.store, delayed("m-1", "orders", Utc::now())).await;
    harness.start();

    harness.dispatcher.wait_for("orders", 1, WAIT).await;
    harness.store.wait_until_empty(WAIT).await.expect("entry removed");
    harness.poller.stop().await;

    assert_eq!(harness.dispatcher.attempts("orders"), 3);
    assert!(harness.dispatcher.sent_to(ERROR_QUEUE).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_queue_skips_retry_budget() {
    let mut config = config();
    config.number_of_retries = 10;
    let harness = Harness::new(&config);
    harness.dispatcher.missing_queue("nowhere");

    store_committed(&harness.store, delayed("m-1", "nowhere", Utc::now())).await;
    harness.start();

    let forwarded = harness.dispatcher.wait_for(ERROR_QUEUE, 1, WAIT).await;
    harness.store.wait_until_empty(WAIT).await.expect("entry removed");
    harness.poller.stop().await;

    assert_eq!(harness.dispatcher.attempts("nowhere"), 1);
    assert_eq!(
        forwarded[0]
            .message
            .headers
            .get(headers::EXCEPTION_TYPE)
            .map(String::as_str),
        Some("Dispatch.QueueNotFound")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signal_wakes_poller_before_timer() {
    let mut config = config();
    config.max_sleep_millis = 30_000;
    let harness = Harness::new(&config);
    harness.start();

    // Let the poller find an empty store and settle into its long sleep
    tokio::time::sleep(Duration::from_millis(200)).await;
    let target = harness.poller.next_wake().expect("sleeping");
    assert!(target > Utc::now() + TimeDelta::seconds(20));

    let due = Utc::now() + TimeDelta::milliseconds(300);
    store_committed(&harness.store, delayed("m-1", "orders", due)).await;
    harness.poller.signal(due);

    harness.dispatcher.wait_for("orders", 1, WAIT).await;
    assert!(Utc::now() >= due);
    harness.poller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signal_later_than_target_is_ignored() {
    let mut config = config();
    config.max_sleep_millis = 30_000;
    let harness = Harness::new(&config);
    harness.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let target = harness.poller.next_wake().expect("sleeping");

    // Waking for something due after the current target would be wasted work
    harness.poller.signal(target + TimeDelta::seconds(60));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.poller.next_wake(), Some(target));

    harness.poller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_future_entry_waits_for_due_time() {
    let harness = Harness::new(&config());
    let due = Utc::now() + TimeDelta::milliseconds(500);
    store_committed(&harness.store, delayed("m-1", "orders", due)).await;
    harness.start();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.dispatcher.sent_to("orders").is_empty());

    harness.dispatcher.wait_for("orders", 1, WAIT).await;
    assert!(Utc::now() >= due);
    harness.poller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_poller_dispatches_nothing() {
    let harness = Harness::new(&config());
    harness.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(WAIT, harness.poller.stop())
        .await
        .expect("stop interrupts the idle sleep");
    assert!(!harness.poller.is_running());

    let due = Utc::now();
    store_committed(&harness.store, delayed("m-1", "orders", due)).await;
    harness.poller.signal(due);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.dispatcher.attempts("orders"), 0);
    assert_eq!(harness.store.message_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_cancellation_stops_loop() {
    let harness = Harness::new(&config());
    harness.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!harness.poller.is_running());
    harness.poller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persistent_fetch_failure_raises_critical_error() {
    let mut config = config();
    config.time_to_trigger_fetch_circuit_breaker_secs = 1;
    let harness = Harness::new(&config);
    harness.store.fail_always(StoreOperation::FetchNextDue);
    store_committed(&harness.store, delayed("m-1", "orders", Utc::now())).await;

    harness.start();
    let raised = harness.critical.wait_for(1, WAIT).await;
    assert!(raised[0].0.contains("DelayedDeliveryFetch"));
    assert!(raised[0].1.contains("fetch_next_due"));

    // Recovery lets the entry through
    harness.store.heal();
    harness.dispatcher.wait_for("orders", 1, WAIT).await;
    harness.poller.stop().await;
    assert_eq!(harness.critical.raised().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_error_forwarding_trips_failure_rate_breaker() {
    let mut config = config();
    config.number_of_retries = 0;
    config.maximum_recovery_failures_per_second = 1;
    let harness = Harness::new(&config);
    harness.dispatcher.fail_always("orders");
    harness.dispatcher.fail_always(ERROR_QUEUE);

    store_committed(&harness.store, delayed("m-1", "orders", Utc::now())).await;
    harness.start();

    let raised = harness.critical.wait_for(1, WAIT).await;
    harness.poller.stop().await;

    assert!(raised[0].0.contains("DelayedDeliveryErrorForwarding"));
    // The entry stays put because forwarding never succeeded
    assert_eq!(harness.store.message_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_count_persisted_between_attempts() {
    let mut config = config();
    config.number_of_retries = 5;
    let harness = Harness::new(&config);
    harness.dispatcher.fail("orders", 2);

    store_committed(&harness.store, delayed("m-1", "orders", Utc::now())).await;
    harness.start();
    harness.dispatcher.wait_for("orders", 1, WAIT).await;
    harness.poller.stop().await;

    assert_eq!(
        harness.store.calls(StoreOperation::IncrementFailureCount),
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_entry_does_not_hold_back_later_entries() {
    let harness = Harness::new(&config());
    harness.dispatcher.fail_always("orders");
    harness.dispatcher.fail_always(ERROR_QUEUE);

    let now = Utc::now();
    store_committed(
        &harness.store,
        delayed("broken", "orders", now - TimeDelta::seconds(1)),
    )
    .await;
    store_committed(&harness.store, delayed("healthy", "billing", now)).await;
    harness.start();

    let sent = harness.dispatcher.wait_for("billing", 1, WAIT).await;
    harness.poller.stop().await;

    assert_eq!(sent[0].message.message_id, "healthy");
    assert!(harness.dispatcher.attempts("orders") >= 1);
    assert!(harness.store.inner().contains("broken"));
    assert!(!harness.store.inner().contains("healthy"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreadable_next_due_time_trips_fetch_breaker() {
    let mut config = config();
    config.time_to_trigger_fetch_circuit_breaker_secs = 1;
    let harness = Harness::new(&config);
    harness.store.fail_always(StoreOperation::Next);

    harness.start();
    let raised = harness.critical.wait_for(1, WAIT).await;
    harness.poller.stop().await;

    assert!(raised[0].0.contains("DelayedDeliveryFetch"));
    assert!(raised[0].1.contains("during next"));
}
