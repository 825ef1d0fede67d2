//! Relational backend on SQLite.
//!
//! Each endpoint gets its own table, `<endpoint>_delayed_messages`, keyed by
//! message id and indexed on due time. Due times are stored as whole seconds
//! since the Unix epoch plus a nanosecond remainder, so an entry comes back
//! with exactly the time it was stored with.
//!
//! # Claiming
//! Every transaction opens its own connection and starts with
//! `BEGIN IMMEDIATE`, taking the database write lock up front. A second
//! transaction waits (up to the busy timeout) until the first commits or
//! rolls back, so an entry fetched by one transaction cannot be handed to
//! another while the first still holds it.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferral_common::TransactionMode;
use rusqlite::{OptionalExtension, types::Value};
use serde::Deserialize;
use tokio_rusqlite::Connection;

use crate::{
    DelayedMessage, Result, StoreError,
    store::{DelayedMessageStore, StoreTransaction, TransactionId},
};

const fn default_busy_timeout_ms() -> u64 {
    5000
}

/// SQLite-backed delayed message store
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteDelayedMessageStore {
    path: PathBuf,

    /// How long a transaction waits for the write lock (in milliseconds)
    #[serde(default = "default_busy_timeout_ms")]
    busy_timeout_ms: u64,

    #[serde(skip)]
    table: Arc<OnceLock<String>>,
}

impl SqliteDelayedMessageStore {
    /// Create a store backed by the database file at `path`
    ///
    /// # Errors
    /// If the path contains `..` components
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        Self::validate_path(&path)?;

        Ok(Self {
            path,
            busy_timeout_ms: default_busy_timeout_ms(),
            table: Arc::default(),
        })
    }

    /// Override how long transactions wait for the write lock
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Reject paths that try to escape their directory
    ///
    /// # Errors
    /// If the path contains `..` components
    pub fn validate_path(path: &Path) -> Result<()> {
        if path
            .components()
            .any(|component| component == std::path::Component::ParentDir)
        {
            return Err(StoreError::InvalidConfiguration(format!(
                "Database path cannot contain '..' components: {}",
                path.display()
            )));
        }

        if path.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfiguration(
                "Database path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Table used for this store, once initialized
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        self.table.get().map(String::as_str)
    }

    async fn connect(&self) -> Result<Connection> {
        let connection = Connection::open(&self.path).await?;
        let busy_timeout = self.busy_timeout();
        connection
            .call(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                Ok(())
            })
            .await?;

        Ok(connection)
    }
}

/// Derive a safe table name from an endpoint name
pub(crate) fn table_name(endpoint_name: &str) -> String {
    let mut table: String = endpoint_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    if table.is_empty() || table.starts_with(|c: char| c.is_ascii_digit()) {
        table.insert(0, '_');
    }

    table.push_str("_delayed_messages");
    table
}

/// Split a due time into `(due_secs, due_nanos)` column values
fn to_columns(time: DateTime<Utc>) -> (i64, i64) {
    (time.timestamp(), i64::from(time.timestamp_subsec_nanos()))
}

fn from_columns(secs: i64, nanos: i64) -> rusqlite::Result<DateTime<Utc>> {
    u32::try_from(nanos)
        .ok()
        .and_then(|nanos| DateTime::<Utc>::from_timestamp(secs, nanos))
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, secs))
}

fn read_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DelayedMessage> {
    let message = DelayedMessage::new(
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        from_columns(row.get(2)?, row.get(3)?)?,
        row.get::<_, Vec<u8>>(4)?,
        row.get::<_, Vec<u8>>(5)?,
    );
    Ok(message.with_retries(row.get(6)?))
}

#[async_trait]
impl DelayedMessageStore for SqliteDelayedMessageStore {
    async fn initialize(&self, endpoint_name: &str, mode: TransactionMode) -> Result<()> {
        let table = table_name(endpoint_name);

        if let Some(existing) = self.table.get()
            && *existing != table
        {
            return Err(StoreError::InvalidConfiguration(format!(
                "Store already initialized for table {existing}, refusing {table}"
            )));
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!(
            path = %self.path.display(),
            table = %table,
            %mode,
            "Initialising SQLite delayed message store"
        );

        let connection = self.connect().await?;
        let schema = format!(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS "{table}" (
                message_id TEXT PRIMARY KEY NOT NULL,
                destination TEXT NOT NULL,
                due_secs INTEGER NOT NULL,
                due_nanos INTEGER NOT NULL,
                headers BLOB NOT NULL,
                body BLOB NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS "{table}_due" ON "{table}" (due_secs, due_nanos);
            "#
        );
        connection
            .call(move |conn| {
                conn.execute_batch(&schema)?;
                Ok(())
            })
            .await?;
        connection.close().await?;

        let _ = self.table.set(table);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let table = self
            .table
            .get()
            .cloned()
            .ok_or_else(|| StoreError::NotInitialized(self.path.display().to_string()))?;

        let connection = self.connect().await?;
        connection
            .call(|conn| {
                conn.execute_batch("BEGIN IMMEDIATE")?;
                Ok(())
            })
            .await?;

        Ok(Box::new(SqliteTransaction {
            id: TransactionId::generate(),
            connection,
            table,
        }))
    }
}

/// A single `BEGIN IMMEDIATE` transaction on its own connection.
///
/// Dropping it closes the connection, which makes SQLite roll back anything
/// not committed.
struct SqliteTransaction {
    id: TransactionId,
    connection: Connection,
    table: String,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    async fn store(&mut self, message: DelayedMessage) -> Result<()> {
        let sql = format!(
            r#"INSERT INTO "{}" (message_id, destination, due_secs, due_nanos, headers, body, retries)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            self.table
        );
        let message_id = message.message_id().to_string();
        let (due_secs, due_nanos) = to_columns(message.time());

        let result = self
            .connection
            .call(move |conn| {
                conn.execute(
                    &sql,
                    rusqlite::params![
                        message.message_id(),
                        message.destination(),
                        due_secs,
                        due_nanos,
                        message.headers(),
                        message.body(),
                        message.number_of_retries(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from);

        match result {
            Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(error, _)))
                if error.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists(message_id))
            }
            other => other,
        }
    }

    async fn next(&mut self) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            r#"SELECT due_secs, due_nanos FROM "{}"
               ORDER BY due_secs ASC, due_nanos ASC
               LIMIT 1"#,
            self.table
        );

        Ok(self
            .connection
            .call(move |conn| {
                Ok(conn
                    .query_row(&sql, [], |row| from_columns(row.get(0)?, row.get(1)?))
                    .optional()?)
            })
            .await?)
    }

    async fn fetch_next_due_excluding(
        &mut self,
        at: DateTime<Utc>,
        excluded: &[String],
    ) -> Result<Option<DelayedMessage>> {
        let mut sql = format!(
            r#"SELECT message_id, destination, due_secs, due_nanos, headers, body, retries
               FROM "{}"
               WHERE (due_secs < ?1 OR (due_secs = ?1 AND due_nanos <= ?2))"#,
            self.table
        );
        if !excluded.is_empty() {
            let placeholders = (3..3 + excluded.len())
                .map(|index| format!("?{index}"))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND message_id NOT IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY due_secs ASC, due_nanos ASC, message_id ASC LIMIT 1");

        let (due_secs, due_nanos) = to_columns(at);
        let mut values = vec![Value::Integer(due_secs), Value::Integer(due_nanos)];
        values.extend(excluded.iter().cloned().map(Value::Text));

        Ok(self
            .connection
            .call(move |conn| {
                Ok(conn
                    .query_row(&sql, rusqlite::params_from_iter(values), read_message)
                    .optional()?)
            })
            .await?)
    }

    async fn remove(&mut self, message: &DelayedMessage) -> Result<bool> {
        let sql = format!(r#"DELETE FROM "{}" WHERE message_id = ?1"#, self.table);
        let message_id = message.message_id().to_string();

        let changed = self
            .connection
            .call(move |conn| Ok(conn.execute(&sql, [message_id])?))
            .await?;
        Ok(changed > 0)
    }

    async fn increment_failure_count(&mut self, message: &DelayedMessage) -> Result<bool> {
        let sql = format!(
            r#"UPDATE "{}" SET retries = retries + 1 WHERE message_id = ?1"#,
            self.table
        );
        let message_id = message.message_id().to_string();

        let changed = self
            .connection
            .call(move |conn| Ok(conn.execute(&sql, [message_id])?))
            .await?;
        Ok(changed > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.connection
            .call(|conn| {
                conn.execute_batch("COMMIT")?;
                Ok(())
            })
            .await?;
        self.connection.close().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.connection
            .call(|conn| {
                conn.execute_batch("ROLLBACK")?;
                Ok(())
            })
            .await?;
        self.connection.close().await?;
        Ok(())
    }
}
