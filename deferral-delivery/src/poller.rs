//! Dispatching delayed messages once they fall due
//!
//! The poller runs one background loop that alternates between two states:
//!
//! ```text
//!            ┌──────────── due entries drained ────────────┐
//!            v                                              │
//!        ┌──────┐   timer / signal   ┌─────────┐            │
//! start─>│ Idle │ ─────────────────> │ Polling │ ───────────┘
//!        └──────┘                    └─────────┘
//!            │ cancelled                  │ cancelled (between entries)
//!            v                            v
//!        ┌─────────┐ <────────────────────┘
//!        │ Stopped │
//!        └─────────┘
//! ```
//!
//! While idle it sleeps until the earliest known due time, capped at the
//! configured ceiling. [`DueDelayedMessagePoller::signal`] wakes it early
//! when a newly stored entry is due sooner than the current target.
//!
//! Each due entry is fetched, dispatched and removed inside one store
//! transaction. Failures bump the entry's failure count in a separate
//! transaction; once the count goes over the retry budget, or the
//! destination does not exist, the entry is moved to the error queue.
//! An entry that fails is passed over for the rest of the drain, so one
//! broken entry never holds back the entries due after it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use deferral_common::{TransactionMode, internal};
use deferral_store::{DelayedMessage, DelayedMessageStore};
use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    CriticalError, DelayedDeliveryConfig, DelayedDeliveryError, FailureRateCircuitBreaker,
    MessageDispatcher, RepeatedFailuresOverTimeCircuitBreaker, Result, SharedError,
    TransportTransaction,
};

/// Name recorded as the fault source of entries the poller gives up on
pub const FAULT_SOURCE: &str = "DueDelayedMessagePoller";

/// Sentinel for "no wake target known"; any signal wakes the poller
const UNKNOWN_WAKE: i64 = i64::MAX;

/// Why a single poll attempt failed
struct PollFailure {
    error: DelayedDeliveryError,
    /// The entry being processed, if the fetch had succeeded
    fetched: Option<DelayedMessage>,
}

impl PollFailure {
    const fn before_fetch(error: DelayedDeliveryError) -> Self {
        Self {
            error,
            fetched: None,
        }
    }

    fn after_fetch(error: impl Into<DelayedDeliveryError>, message: DelayedMessage) -> Self {
        Self {
            error: error.into(),
            fetched: Some(message),
        }
    }
}

struct Shared {
    store: Arc<dyn DelayedMessageStore>,
    dispatcher: MessageDispatcher,
    transaction_mode: TransactionMode,
    number_of_retries: u32,
    max_sleep: Duration,
    fetch_breaker: RepeatedFailuresOverTimeCircuitBreaker,
    dispatch_breaker: RepeatedFailuresOverTimeCircuitBreaker,
    failure_breaker: FailureRateCircuitBreaker,
    signal: Notify,
    /// Wake target of the current idle sleep, in milliseconds since the epoch
    next_wake: AtomicI64,
}

/// Background loop that dispatches stored entries once they are due
pub struct DueDelayedMessagePoller {
    shared: Arc<Shared>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    span: tracing::Span,
}

impl std::fmt::Debug for DueDelayedMessagePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DueDelayedMessagePoller")
            .field("store", &self.shared.store)
            .field("next_wake", &self.next_wake())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl DueDelayedMessagePoller {
    pub fn new(
        config: &DelayedDeliveryConfig,
        store: Arc<dyn DelayedMessageStore>,
        dispatcher: MessageDispatcher,
        critical_error: &Arc<dyn CriticalError>,
    ) -> Self {
        let backoff = config.failure_backoff();

        Self {
            shared: Arc::new(Shared {
                store,
                dispatcher,
                transaction_mode: config.transaction_mode,
                number_of_retries: config.number_of_retries,
                max_sleep: config.max_sleep(),
                fetch_breaker: RepeatedFailuresOverTimeCircuitBreaker::new(
                    "DelayedDeliveryFetch",
                    config.time_to_trigger_fetch_circuit_breaker(),
                    backoff,
                    Arc::clone(critical_error),
                ),
                dispatch_breaker: RepeatedFailuresOverTimeCircuitBreaker::new(
                    "DelayedDeliveryDispatch",
                    config.time_to_trigger_dispatch_circuit_breaker(),
                    backoff,
                    Arc::clone(critical_error),
                ),
                failure_breaker: FailureRateCircuitBreaker::new(
                    "DelayedDeliveryErrorForwarding",
                    config.maximum_recovery_failures_per_second,
                    Arc::clone(critical_error),
                ),
                signal: Notify::new(),
                next_wake: AtomicI64::new(UNKNOWN_WAKE),
            }),
            running: Mutex::new(None),
            span: tracing::info_span!(
                target: "deferral",
                "poller",
                endpoint = %config.endpoint_name
            ),
        }
    }

    /// Replace the span the polling loop runs in
    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Start the background loop; it stops when `cancel` fires or
    /// [`Self::stop`] is called
    ///
    /// # Errors
    /// If the poller is already running
    pub fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(DelayedDeliveryError::Configuration(
                "Poller is already running".to_string(),
            ));
        }

        let cancel = cancel.child_token();
        let handle = tokio::spawn(
            Arc::clone(&self.shared)
                .run(cancel.clone())
                .instrument(self.span.clone()),
        );
        *running = Some((cancel, handle));

        internal!(level = INFO, "Delayed message poller started");
        Ok(())
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// An entry being processed when stop is requested is committed or rolled
    /// back before this returns; no further entries are taken.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some((cancel, handle)) = running else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Delayed message poller task failed");
        }

        self.shared.next_wake.store(UNKNOWN_WAKE, Ordering::Release);
        internal!(level = INFO, "Delayed message poller stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Wake the poller if `due` is earlier than its current wake target.
    ///
    /// Best effort: while the poller is draining, the wake is remembered and
    /// consumed by the next idle sleep. Repeated signals coalesce into one
    /// pending wake.
    pub fn signal(&self, due: DateTime<Utc>) {
        let due = due.timestamp_millis();
        if due < self.shared.next_wake.load(Ordering::Acquire) {
            tracing::trace!(due, "Signalling delayed message poller");
            self.shared.signal.notify_one();
        }
    }

    /// Instant the poller currently plans to wake at, if sleeping
    #[must_use]
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        match self.shared.next_wake.load(Ordering::Acquire) {
            UNKNOWN_WAKE => None,
            millis => DateTime::<Utc>::from_timestamp_millis(millis),
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.drain(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }

            let sleep = self.sleep_duration(&cancel).await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.signal.notified() => {
                    internal!(level = DEBUG, "Poller woken by signal");
                }
                () = tokio::time::sleep(sleep) => {}
            }
        }

        internal!(level = DEBUG, "Polling loop exited");
    }

    /// How long to sleep before the next drain; publishes the wake target
    async fn sleep_duration(&self, cancel: &CancellationToken) -> Duration {
        let now = Utc::now();
        let next = match self.store.next().await {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(error = %e, "Unable to read next due time, sleeping for the maximum");
                self.fetch_breaker
                    .failure(DelayedDeliveryError::from(e).shared(), cancel)
                    .await;
                None
            }
        };

        let sleep = next
            .map_or(self.max_sleep, |next| {
                (next - now).to_std().unwrap_or(Duration::ZERO)
            })
            .min(self.max_sleep);

        let wake = now
            + chrono::Duration::from_std(sleep).unwrap_or_else(|_| chrono::Duration::zero());
        self.next_wake
            .store(wake.timestamp_millis(), Ordering::Release);

        tracing::trace!(sleep_ms = sleep.as_millis(), "Poller going idle");
        sleep
    }

    /// Process due entries until none are left, the store cannot be read or
    /// shutdown.
    ///
    /// Entries that fail are skipped for the rest of this drain and picked up
    /// again by the next one.
    async fn drain(&self, cancel: &CancellationToken) {
        // Until a new target is computed, any signal must wake the loop
        self.next_wake.store(UNKNOWN_WAKE, Ordering::Release);
        let mut failed = Vec::new();

        while !cancel.is_cancelled() {
            match self.poll_one(&failed).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(failure) => {
                    let message_id = failure
                        .fetched
                        .as_ref()
                        .map(|message| message.message_id().to_string());
                    self.handle_failure(failure, cancel).await;

                    match message_id {
                        Some(message_id) => failed.push(message_id),
                        None => return,
                    }
                }
            }
        }
    }

    /// Fetch, dispatch and remove a single due entry, passing over the
    /// entries in `skip`
    ///
    /// Returns `false` when nothing is due.
    async fn poll_one(&self, skip: &[String]) -> std::result::Result<bool, PollFailure> {
        let mut transaction = self
            .store
            .begin()
            .await
            .map_err(|e| PollFailure::before_fetch(e.into()))?;

        let fetched = transaction
            .fetch_next_due_excluding(Utc::now(), skip)
            .await
            .map_err(|e| PollFailure::before_fetch(e.into()))?;
        self.fetch_breaker.success();

        let Some(message) = fetched else {
            if let Err(e) = transaction.rollback().await {
                tracing::debug!(error = %e, "Releasing empty poll transaction failed");
            }
            return Ok(false);
        };

        let transport = TransportTransaction::within(self.transaction_mode, transaction.id());
        if let Err(e) = self.dispatcher.dispatch_delayed(&message, &transport).await {
            if let Err(rollback) = transaction.rollback().await {
                tracing::debug!(error = %rollback, "Rolling back failed dispatch failed");
            }
            return Err(PollFailure::after_fetch(e, message));
        }

        match transaction.remove(&message).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                message_id = message.message_id(),
                destination = message.destination(),
                "Delayed message was already removed; it may have been dispatched twice"
            ),
            Err(e) => return Err(PollFailure::after_fetch(e, message)),
        }

        if let Err(e) = transaction.commit().await {
            return Err(PollFailure::after_fetch(e, message));
        }

        self.dispatch_breaker.success();
        tracing::debug!(
            message_id = message.message_id(),
            destination = message.destination(),
            due = %message.time(),
            "Delayed message dispatched"
        );
        Ok(true)
    }

    async fn handle_failure(&self, failure: PollFailure, cancel: &CancellationToken) {
        let PollFailure { error, fetched } = failure;

        let Some(message) = fetched else {
            tracing::warn!(error = %error, "Failed to fetch due delayed messages");
            self.fetch_breaker.failure(error.shared(), cancel).await;
            return;
        };

        let attempt = message.number_of_retries().saturating_add(1);
        tracing::warn!(
            message_id = message.message_id(),
            destination = message.destination(),
            attempt,
            error = %error,
            "Failed to dispatch delayed message"
        );

        let error = error.shared();
        if Self::is_queue_not_found(&error) {
            self.forward_to_error_queue(&message, &error, cancel).await;
        } else {
            match self.increment_failure_count(&message).await {
                Ok(true) if attempt > self.number_of_retries => {
                    self.forward_to_error_queue(&message, &error, cancel).await;
                }
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    message_id = message.message_id(),
                    "Delayed message disappeared before its failure could be counted"
                ),
                Err(e) => tracing::warn!(
                    message_id = message.message_id(),
                    error = %e,
                    "Failed to record dispatch failure"
                ),
            }
        }

        self.dispatch_breaker.failure(error, cancel).await;
    }

    fn is_queue_not_found(error: &SharedError) -> bool {
        error
            .downcast_ref::<DelayedDeliveryError>()
            .is_some_and(DelayedDeliveryError::is_queue_not_found)
    }

    /// Bump the failure count in its own transaction so it survives the
    /// rollback of the failed dispatch
    async fn increment_failure_count(&self, message: &DelayedMessage) -> Result<bool> {
        let mut transaction = self.store.begin().await?;
        let incremented = transaction.increment_failure_count(message).await?;
        transaction.commit().await?;
        Ok(incremented)
    }

    async fn forward_to_error_queue(
        &self,
        message: &DelayedMessage,
        error: &SharedError,
        cancel: &CancellationToken,
    ) {
        match self.try_forward_to_error_queue(message, error).await {
            Ok(true) => tracing::warn!(
                message_id = message.message_id(),
                destination = message.destination(),
                error_queue = self.dispatcher.error_queue(),
                "Delayed message moved to the error queue"
            ),
            Ok(false) => tracing::debug!(
                message_id = message.message_id(),
                "Delayed message already handled elsewhere, not forwarding"
            ),
            Err(e) => {
                tracing::error!(
                    message_id = message.message_id(),
                    error = %e,
                    "Failed to move delayed message to the error queue"
                );
                self.failure_breaker.failure(e.shared(), cancel).await;
            }
        }
    }

    async fn try_forward_to_error_queue(
        &self,
        message: &DelayedMessage,
        error: &SharedError,
    ) -> Result<bool> {
        let mut transaction = self.store.begin().await?;
        if !transaction.remove(message).await? {
            transaction.rollback().await?;
            return Ok(false);
        }

        let transport = TransportTransaction::within(self.transaction_mode, transaction.id());
        self.dispatcher
            .forward_delayed_to_error_queue(message, error, FAULT_SOURCE, &transport)
            .await?;
        transaction.commit().await?;
        Ok(true)
    }
}
