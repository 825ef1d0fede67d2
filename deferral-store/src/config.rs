use std::sync::Arc;

use serde::Deserialize;

use crate::{
    Result,
    backends::{MemoryDelayedMessageStore, SqliteDelayedMessageStore},
    store::DelayedMessageStore,
};

/// Configuration for the delayed message store backend
///
/// # Examples
///
/// SQLite-backed store in RON config:
/// ```ron
/// store: (
///     type: "Sqlite",
///     path: "/var/lib/deferral/delayed.sqlite",
///     busy_timeout_ms: 5000,
/// )
/// ```
///
/// Memory-backed store with a capacity limit:
/// ```ron
/// store: (
///     type: "Memory",
///     capacity: 1000,
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// SQLite-backed store (production)
    Sqlite(SqliteDelayedMessageStore),
    /// Memory-backed store (testing/development)
    Memory(MemoryConfig),
}

/// Configuration for the memory-backed store
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of entries to store (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(MemoryConfig::default())
    }
}

impl StoreConfig {
    /// Database path for SQLite-backed stores
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Sqlite(store) => Some(store.path()),
            Self::Memory(_) => None,
        }
    }

    /// Check the configuration before building a store from it
    ///
    /// # Errors
    /// If the SQLite path is empty or escapes its directory, or a memory
    /// capacity of zero was configured
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Sqlite(store) => SqliteDelayedMessageStore::validate_path(store.path()),
            Self::Memory(MemoryConfig { capacity: Some(0) }) => {
                Err(crate::StoreError::InvalidConfiguration(
                    "Memory store capacity must be greater than zero".to_string(),
                ))
            }
            Self::Memory(_) => Ok(()),
        }
    }

    /// Convert the configuration into a concrete store
    #[must_use]
    pub fn into_store(self) -> Arc<dyn DelayedMessageStore> {
        match self {
            Self::Sqlite(store) => Arc::new(store),
            Self::Memory(config) => config.capacity.map_or_else(
                || Arc::new(MemoryDelayedMessageStore::new()),
                |capacity| Arc::new(MemoryDelayedMessageStore::with_capacity(capacity)),
            ),
        }
    }
}
