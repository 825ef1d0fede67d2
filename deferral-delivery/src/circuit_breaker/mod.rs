//! Failure isolation for the delayed-delivery loops
//!
//! Two breakers guard the poller and the pump:
//!
//! - [`RepeatedFailuresOverTimeCircuitBreaker`] escalates once failures have
//!   continued, without an intervening success, for longer than a window.
//!   It guards storing (pump), fetching and dispatching (poller).
//! - [`FailureRateCircuitBreaker`] escalates when failures arrive faster than
//!   a configured rate. It guards the error-queue forwarding path, which has
//!   no retry loop of its own.
//!
//! Escalation means invoking the host's [`CriticalError`] callback. Every
//! concern gets its own breaker instance so that one outage never masks
//! another.
//!
//! # Example
//!
//! ```text
//! Window: 30 seconds
//!
//! t=0s:   failure -> armed, timer started
//! t=1s..: failures -> still armed, callback not invoked
//! t=30s:  timer fires, still failing -> callback invoked (once)
//! t=31s:  failure -> already triggered, nothing new
//! t=40s:  success -> disarmed, next failure starts a new window
//! ```

mod failure_rate;
mod repeated_failures;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use failure_rate::FailureRateCircuitBreaker;
pub use repeated_failures::RepeatedFailuresOverTimeCircuitBreaker;

use crate::SharedError;

/// Host callback raised when a breaker trips or a delayed message could not
/// be stored.
///
/// Errors returned by the callback are logged and otherwise ignored.
#[async_trait]
pub trait CriticalError: Send + Sync {
    async fn raise(
        &self,
        description: &str,
        error: SharedError,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Callback that only logs, for hosts without a critical-error policy
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCriticalError;

#[async_trait]
impl CriticalError for LogCriticalError {
    async fn raise(
        &self,
        description: &str,
        error: SharedError,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::error!(error = %error, "Critical error: {description}");
        Ok(())
    }
}

/// Invoke `callback`, logging instead of propagating its failure
pub(crate) async fn raise_critical_error(
    callback: &Arc<dyn CriticalError>,
    description: &str,
    error: SharedError,
    cancel: CancellationToken,
) {
    if let Err(e) = callback.raise(description, error, cancel).await {
        tracing::error!(
            error = %e,
            "Critical error callback failed while reporting: {description}"
        );
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Whether the breaker has escalated in the current episode or window
    pub triggered: bool,
    /// Failures counted in the current streak or window
    pub failure_count: u64,
}
