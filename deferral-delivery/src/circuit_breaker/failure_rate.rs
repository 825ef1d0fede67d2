use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{CircuitBreakerStats, CriticalError, raise_critical_error};
use crate::SharedError;

#[derive(Debug)]
struct Window {
    started: Instant,
    failures: u64,
    triggered: bool,
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            failures: 0,
            triggered: false,
        }
    }
}

/// Escalates when failures arrive faster than an allowed rate
///
/// Failures are counted in fixed windows. Once the count in the current
/// window goes above the allowance, the critical-error callback is invoked;
/// it is invoked at most once per window.
pub struct FailureRateCircuitBreaker {
    name: String,
    window: Duration,
    allowed_failures: u64,
    state: Mutex<Window>,
    critical_error: Arc<dyn CriticalError>,
}

impl std::fmt::Debug for FailureRateCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureRateCircuitBreaker")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("allowed_failures", &self.allowed_failures)
            .finish_non_exhaustive()
    }
}

impl FailureRateCircuitBreaker {
    /// Create a breaker that allows `maximum_failures_per_second` failures
    /// in each one-second window
    pub fn new(
        name: impl Into<String>,
        maximum_failures_per_second: u32,
        critical_error: Arc<dyn CriticalError>,
    ) -> Self {
        Self::with_window(
            name,
            maximum_failures_per_second,
            Duration::from_secs(1),
            critical_error,
        )
    }

    /// Create a breaker with a custom counting window; the allowance scales
    /// with the window length and never drops below one failure
    pub fn with_window(
        name: impl Into<String>,
        maximum_failures_per_second: u32,
        window: Duration,
        critical_error: Arc<dyn CriticalError>,
    ) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let allowed_failures =
            ((f64::from(maximum_failures_per_second) * window.as_secs_f64()).ceil() as u64).max(1);

        Self {
            name: name.into(),
            window,
            allowed_failures,
            state: Mutex::new(Window::new()),
            critical_error,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of failures tolerated per window
    #[must_use]
    pub const fn allowed_failures(&self) -> u64 {
        self.allowed_failures
    }

    /// Record a failure, returning `true` if it tripped the breaker
    pub async fn failure(&self, error: SharedError, cancel: &CancellationToken) -> bool {
        let (tripped, failures) = {
            let mut window = self.state.lock();
            if window.started.elapsed() >= self.window {
                *window = Window::new();
            }

            window.failures += 1;
            let tripped = window.failures > self.allowed_failures && !window.triggered;
            if tripped {
                window.triggered = true;
            }
            (tripped, window.failures)
        };

        if !tripped {
            tracing::debug!(
                breaker = %self.name,
                failures,
                allowed = self.allowed_failures,
                "Failure recorded"
            );
            return false;
        }

        tracing::error!(
            breaker = %self.name,
            failures,
            allowed = self.allowed_failures,
            error = %error,
            "Failure rate exceeded"
        );

        let description = format!(
            "{} failed {failures} times within {}ms",
            self.name,
            self.window.as_millis()
        );
        raise_critical_error(&self.critical_error, &description, error, cancel.clone()).await;
        true
    }

    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let window = self.state.lock();
        CircuitBreakerStats {
            triggered: window.triggered,
            failure_count: window.failures,
        }
    }
}
