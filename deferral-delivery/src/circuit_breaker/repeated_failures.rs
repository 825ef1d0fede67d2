use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{CircuitBreakerStats, CriticalError, raise_critical_error};
use crate::SharedError;

#[derive(Debug)]
struct Inner {
    name: String,
    time_to_wait_before_triggering: Duration,
    delay_after_failure: Duration,
    failure_count: AtomicU64,
    triggered: AtomicBool,
    /// Bumped on every reset so that a timer armed in an earlier episode
    /// never fires for a later one
    episode: AtomicU64,
    last_failure: Mutex<Option<SharedError>>,
}

/// Escalates when failures continue for longer than a window
///
/// The first failure of a streak arms a timer. If the streak is still going
/// when the timer fires, the critical-error callback is invoked with the most
/// recent failure. A streak escalates at most once; [`Self::success`] ends
/// the streak and allows a new one to escalate.
///
/// State is kept in atomics so `failure` and `success` can be called
/// concurrently from any task.
#[derive(Clone)]
pub struct RepeatedFailuresOverTimeCircuitBreaker {
    inner: Arc<Inner>,
    critical_error: Arc<dyn CriticalError>,
}

impl std::fmt::Debug for RepeatedFailuresOverTimeCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatedFailuresOverTimeCircuitBreaker")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl RepeatedFailuresOverTimeCircuitBreaker {
    /// Create a breaker named `name` that escalates after failures persist
    /// for `time_to_wait_before_triggering`, pausing the failing caller for
    /// `delay_after_failure` after each failure
    pub fn new(
        name: impl Into<String>,
        time_to_wait_before_triggering: Duration,
        delay_after_failure: Duration,
        critical_error: Arc<dyn CriticalError>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                time_to_wait_before_triggering,
                delay_after_failure,
                failure_count: AtomicU64::new(0),
                triggered: AtomicBool::new(false),
                episode: AtomicU64::new(0),
                last_failure: Mutex::new(None),
            }),
            critical_error,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// End the current failure streak
    pub fn success(&self) {
        if self.inner.failure_count.swap(0, Ordering::AcqRel) == 0 {
            return;
        }

        self.inner.episode.fetch_add(1, Ordering::AcqRel);
        self.inner.triggered.store(false, Ordering::Release);
        self.inner.last_failure.lock().take();

        tracing::info!(breaker = %self.inner.name, "Circuit breaker disarmed");
    }

    /// Record a failure, arming the trigger timer if this starts a streak,
    /// then pause the caller for the configured failure delay.
    ///
    /// The pause ends early if `cancel` fires.
    pub async fn failure(&self, error: SharedError, cancel: &CancellationToken) {
        *self.inner.last_failure.lock() = Some(Arc::clone(&error));

        if self.inner.failure_count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.arm(cancel.clone());
            tracing::warn!(
                breaker = %self.inner.name,
                error = %error,
                window_secs = self.inner.time_to_wait_before_triggering.as_secs(),
                "Circuit breaker armed"
            );
        }

        tokio::select! {
            () = tokio::time::sleep(self.inner.delay_after_failure) => {}
            () = cancel.cancelled() => {}
        }
    }

    /// Whether the current streak has escalated
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            triggered: self.is_triggered(),
            failure_count: self.inner.failure_count.load(Ordering::Acquire),
        }
    }

    fn arm(&self, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        let critical_error = Arc::clone(&self.critical_error);
        let episode = inner.episode.load(Ordering::Acquire);

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(inner.time_to_wait_before_triggering) => {}
                () = cancel.cancelled() => return,
            }

            if inner.episode.load(Ordering::Acquire) != episode
                || inner.failure_count.load(Ordering::Acquire) == 0
                || inner.triggered.swap(true, Ordering::AcqRel)
            {
                return;
            }

            let Some(error) = inner.last_failure.lock().clone() else {
                return;
            };

            tracing::error!(
                breaker = %inner.name,
                failure_count = inner.failure_count.load(Ordering::Acquire),
                error = %error,
                "Circuit breaker triggered"
            );

            let description = format!(
                "{} failing for more than {} seconds",
                inner.name,
                inner.time_to_wait_before_triggering.as_secs()
            );
            raise_critical_error(&critical_error, &description, error, cancel).await;
        });
    }
}
