//! Delayed delivery configuration
//!
//! ```ron
//! DelayedDelivery (
//!     endpoint_name: "Sales",
//!     error_queue: "error",
//!     number_of_retries: 5,
//!     max_sleep_millis: 30000,
//!     store: (
//!         type: "Sqlite",
//!         path: "/var/lib/deferral/sales.sqlite",
//!     ),
//! )
//! ```

use std::{path::Path, time::Duration};

use deferral_common::{Headers, TransactionMode};
use deferral_store::StoreConfig;
use serde::Deserialize;

use crate::{DelayedDeliveryError, Result};

const fn default_number_of_retries() -> u32 {
    3
}

const fn default_time_to_trigger_secs() -> u64 {
    30
}

const fn default_maximum_recovery_failures_per_second() -> u32 {
    1
}

const fn default_max_sleep_millis() -> u64 {
    60_000 // Re-check the store at least once a minute
}

const fn default_failure_backoff_millis() -> u64 {
    1000
}

const fn default_concurrency() -> usize {
    1
}

/// Settings shared by the delayed-delivery pump and the due-message poller
#[derive(Debug, Clone, Deserialize)]
pub struct DelayedDeliveryConfig {
    /// Endpoint this subsystem belongs to; also names the store table
    pub endpoint_name: String,

    /// Queue the tagged deliver-later messages arrive on
    /// (default: `<endpoint_name>.timeouts`)
    #[serde(default)]
    pub timeouts_queue: Option<String>,

    /// Queue that receives messages which cannot be delivered
    pub error_queue: String,

    /// Dispatch failures tolerated before an entry is moved to the error
    /// queue; also the number of immediate retries for tagged messages
    #[serde(default = "default_number_of_retries")]
    pub number_of_retries: u32,

    /// How long storing may keep failing before the host is told (seconds)
    #[serde(default = "default_time_to_trigger_secs")]
    pub time_to_trigger_store_circuit_breaker_secs: u64,

    /// How long fetching may keep failing before the host is told (seconds)
    #[serde(default = "default_time_to_trigger_secs")]
    pub time_to_trigger_fetch_circuit_breaker_secs: u64,

    /// How long dispatching may keep failing before the host is told (seconds)
    #[serde(default = "default_time_to_trigger_secs")]
    pub time_to_trigger_dispatch_circuit_breaker_secs: u64,

    /// Failures per second tolerated while forwarding to the error queue
    #[serde(default = "default_maximum_recovery_failures_per_second")]
    pub maximum_recovery_failures_per_second: u32,

    /// Upper bound on how long the poller sleeps between store checks
    #[serde(default = "default_max_sleep_millis")]
    pub max_sleep_millis: u64,

    /// Pause applied after each store, fetch or dispatch failure
    #[serde(default = "default_failure_backoff_millis")]
    pub failure_backoff_millis: u64,

    #[serde(default)]
    pub transaction_mode: TransactionMode,

    /// Tagged messages processed concurrently on the receive side
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Static headers added to every message forwarded to the error queue
    #[serde(default)]
    pub fault_metadata: Headers,

    #[serde(default)]
    pub store: StoreConfig,
}

impl DelayedDeliveryConfig {
    /// Create a configuration with defaults for everything but the names
    pub fn new(endpoint_name: impl Into<String>, error_queue: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            timeouts_queue: None,
            error_queue: error_queue.into(),
            number_of_retries: default_number_of_retries(),
            time_to_trigger_store_circuit_breaker_secs: default_time_to_trigger_secs(),
            time_to_trigger_fetch_circuit_breaker_secs: default_time_to_trigger_secs(),
            time_to_trigger_dispatch_circuit_breaker_secs: default_time_to_trigger_secs(),
            maximum_recovery_failures_per_second: default_maximum_recovery_failures_per_second(),
            max_sleep_millis: default_max_sleep_millis(),
            failure_backoff_millis: default_failure_backoff_millis(),
            transaction_mode: TransactionMode::default(),
            concurrency: default_concurrency(),
            fault_metadata: Headers::default(),
            store: StoreConfig::default(),
        }
    }

    /// Parse and validate a RON configuration
    ///
    /// # Errors
    /// If the text is not valid RON for this structure, or fails validation
    pub fn from_ron_str(text: &str) -> Result<Self> {
        let config: Self = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a RON configuration file
    ///
    /// # Errors
    /// If the file cannot be read, parsed or validated
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_ron_str(&text)
    }

    /// Check the configuration for values the subsystem cannot run with
    ///
    /// # Errors
    /// Describes the first invalid value found
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_name.trim().is_empty() {
            return Err(DelayedDeliveryError::Configuration(
                "endpoint_name cannot be empty".to_string(),
            ));
        }

        if self.error_queue.trim().is_empty() {
            return Err(DelayedDeliveryError::Configuration(
                "error_queue cannot be empty".to_string(),
            ));
        }

        if self.error_queue == self.timeouts_queue() {
            return Err(DelayedDeliveryError::Configuration(format!(
                "error_queue must differ from the timeouts queue ({})",
                self.error_queue
            )));
        }

        if self.max_sleep_millis == 0 {
            return Err(DelayedDeliveryError::Configuration(
                "max_sleep_millis must be greater than zero".to_string(),
            ));
        }

        if self.concurrency == 0 {
            return Err(DelayedDeliveryError::Configuration(
                "concurrency must be greater than zero".to_string(),
            ));
        }

        if self.maximum_recovery_failures_per_second == 0 {
            return Err(DelayedDeliveryError::Configuration(
                "maximum_recovery_failures_per_second must be greater than zero".to_string(),
            ));
        }

        self.store.validate()?;
        Ok(())
    }

    /// Queue the tagged messages arrive on
    #[must_use]
    pub fn timeouts_queue(&self) -> String {
        self.timeouts_queue
            .clone()
            .unwrap_or_else(|| format!("{}.timeouts", self.endpoint_name))
    }

    #[must_use]
    pub const fn max_sleep(&self) -> Duration {
        Duration::from_millis(self.max_sleep_millis)
    }

    #[must_use]
    pub const fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_millis)
    }

    #[must_use]
    pub const fn time_to_trigger_store_circuit_breaker(&self) -> Duration {
        Duration::from_secs(self.time_to_trigger_store_circuit_breaker_secs)
    }

    #[must_use]
    pub const fn time_to_trigger_fetch_circuit_breaker(&self) -> Duration {
        Duration::from_secs(self.time_to_trigger_fetch_circuit_breaker_secs)
    }

    #[must_use]
    pub const fn time_to_trigger_dispatch_circuit_breaker(&self) -> Duration {
        Duration::from_secs(self.time_to_trigger_dispatch_circuit_breaker_secs)
    }
}
