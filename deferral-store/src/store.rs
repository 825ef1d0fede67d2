//! The storage contract every delayed-message backend implements.
//!
//! The store owns its transaction lifecycle: callers open a unit of work
//! with [`DelayedMessageStore::begin`], run operations on the returned
//! [`StoreTransaction`], then commit or roll back. Dropping a transaction
//! without finishing it rolls it back.
//!
//! # Claiming
//!
//! [`StoreTransaction::fetch_next_due`] claims the entry it returns. The
//! claim is held until the transaction finishes, and no other transaction
//! can fetch the same entry while it is held. Exclusivity is provided by
//! the backend (row locking, write locks, claim tables), never by callers.
//!
//! # Cancellation
//!
//! All operations are futures and can be abandoned by dropping them; a
//! transaction abandoned mid-flight is rolled back when it is dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferral_common::TransactionMode;

use crate::{DelayedMessage, Result};

/// Identifier of a single store transaction, used for logging and claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(ulid::Ulid);

impl TransactionId {
    /// Generate a new unique transaction ID
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable keyed storage for pending delayed messages
#[async_trait]
pub trait DelayedMessageStore: Send + Sync + std::fmt::Debug {
    /// One-time setup such as schema creation.
    ///
    /// Must be idempotent: calling it again against a backend that was
    /// already initialized succeeds without duplicating anything.
    ///
    /// # Errors
    /// If the backend cannot be prepared
    async fn initialize(&self, endpoint_name: &str, mode: TransactionMode) -> Result<()>;

    /// Open a new unit of work
    ///
    /// # Errors
    /// If the backend cannot start a transaction (e.g. it is unreachable)
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Due time of the earliest stored entry, if any, read in a throwaway
    /// transaction.
    ///
    /// The answer may be stale under concurrent writers. It only drives how
    /// long the poller sleeps, so a slightly late answer is acceptable.
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn next(&self) -> Result<Option<DateTime<Utc>>> {
        let mut transaction = self.begin().await?;
        let next = transaction.next().await;
        transaction.rollback().await?;
        next
    }
}

/// A unit of work against a [`DelayedMessageStore`]
#[async_trait]
pub trait StoreTransaction: Send {
    fn id(&self) -> TransactionId;

    /// Durably persist a new entry.
    ///
    /// # Errors
    /// Any storage failure, or [`crate::StoreError::AlreadyExists`] when an
    /// entry with the same message id is already stored
    async fn store(&mut self, message: DelayedMessage) -> Result<()>;

    /// Due time of the earliest stored entry
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn next(&mut self) -> Result<Option<DateTime<Utc>>>;

    /// Claim and return one entry whose due time is at or before `at`
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn fetch_next_due(&mut self, at: DateTime<Utc>) -> Result<Option<DelayedMessage>> {
        self.fetch_next_due_excluding(at, &[]).await
    }

    /// Like [`Self::fetch_next_due`], passing over entries whose message id
    /// is in `excluded`.
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn fetch_next_due_excluding(
        &mut self,
        at: DateTime<Utc>,
        excluded: &[String],
    ) -> Result<Option<DelayedMessage>>;

    /// Delete the entry by key, reporting whether anything was removed.
    ///
    /// `false` means another actor already removed it; callers treat that
    /// as a benign race.
    ///
    /// # Errors
    /// If the backend cannot be written
    async fn remove(&mut self, message: &DelayedMessage) -> Result<bool>;

    /// Bump the stored failure count, reporting whether a row was affected
    ///
    /// # Errors
    /// If the backend cannot be written
    async fn increment_failure_count(&mut self, message: &DelayedMessage) -> Result<bool>;

    /// Make every change in this transaction durable and release its claims
    ///
    /// # Errors
    /// If the backend refuses the commit; the changes are then discarded
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every change in this transaction and release its claims
    ///
    /// # Errors
    /// If the backend fails while rolling back
    async fn rollback(self: Box<Self>) -> Result<()>;
}
