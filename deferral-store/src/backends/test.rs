use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferral_common::TransactionMode;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::memory::MemoryDelayedMessageStore;
use crate::{
    DelayedMessage, Result, StoreError,
    store::{DelayedMessageStore, StoreTransaction, TransactionId},
};

/// Store operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Initialize,
    Begin,
    Store,
    Next,
    FetchNextDue,
    Remove,
    IncrementFailureCount,
    Commit,
}

impl std::fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::Begin => "begin",
            Self::Store => "store",
            Self::Next => "next",
            Self::FetchNextDue => "fetch_next_due",
            Self::Remove => "remove",
            Self::IncrementFailureCount => "increment_failure_count",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// Remaining failures per operation (None = fail until healed)
    pending: AHashMap<StoreOperation, Option<usize>>,
    calls: AHashMap<StoreOperation, usize>,
}

impl Faults {
    fn check(&mut self, operation: StoreOperation) -> Result<()> {
        *self.calls.entry(operation).or_default() += 1;

        match self.pending.get_mut(&operation) {
            None => Ok(()),
            Some(None) => Err(StoreError::Injected(operation.to_string())),
            Some(Some(remaining)) => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.pending.remove(&operation);
                }
                Err(StoreError::Injected(operation.to_string()))
            }
        }
    }
}

/// Testing wrapper around the memory store
///
/// Adds fault injection per [`StoreOperation`], call counting and a way to
/// wait for commits before making assertions.
#[derive(Debug, Clone)]
pub struct TestDelayedMessageStore {
    inner: MemoryDelayedMessageStore,
    faults: Arc<Mutex<Faults>>,
    notify: Arc<Notify>,
}

impl Default for TestDelayedMessageStore {
    fn default() -> Self {
        Self {
            inner: MemoryDelayedMessageStore::new(),
            faults: Arc::default(),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl TestDelayedMessageStore {
    /// Create a new test store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped memory store, for direct inspection
    #[must_use]
    pub const fn inner(&self) -> &MemoryDelayedMessageStore {
        &self.inner
    }

    /// Make the next `times` calls of `operation` fail
    pub fn fail(&self, operation: StoreOperation, times: usize) {
        if times > 0 {
            self.faults.lock().pending.insert(operation, Some(times));
        }
    }

    /// Make every call of `operation` fail until [`Self::heal`] is called
    pub fn fail_always(&self, operation: StoreOperation) {
        self.faults.lock().pending.insert(operation, None);
    }

    /// Remove every injected fault
    pub fn heal(&self) {
        self.faults.lock().pending.clear();
    }

    /// How many times `operation` has been attempted, failed or not
    #[must_use]
    pub fn calls(&self, operation: StoreOperation) -> usize {
        self.faults
            .lock()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or_default()
    }

    /// Number of stored entries
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.len()
    }

    /// Clear all entries from the store
    pub fn clear(&self) {
        self.inner.clear();
        self.notify.notify_waiters();
    }

    /// Wait until `predicate` holds for the number of stored entries
    ///
    /// # Errors
    /// Returns an error if the timeout is reached first
    pub async fn wait_for(
        &self,
        predicate: impl Fn(usize) -> bool,
        timeout: Duration,
    ) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if predicate(self.inner.len()) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|e| StoreError::Internal(format!("Timeout waiting for delayed messages: {e}")))
    }

    /// Wait until at least `expected` entries are stored
    ///
    /// # Errors
    /// Returns an error if the timeout is reached first
    pub async fn wait_for_count(&self, expected: usize, timeout: Duration) -> Result<()> {
        self.wait_for(|count| count >= expected, timeout).await
    }

    /// Wait until the store is empty
    ///
    /// # Errors
    /// Returns an error if the timeout is reached first
    pub async fn wait_until_empty(&self, timeout: Duration) -> Result<()> {
        self.wait_for(|count| count == 0, timeout).await
    }

    fn check(&self, operation: StoreOperation) -> Result<()> {
        self.faults.lock().check(operation)
    }
}

#[async_trait]
impl DelayedMessageStore for TestDelayedMessageStore {
    async fn initialize(&self, endpoint_name: &str, mode: TransactionMode) -> Result<()> {
        self.check(StoreOperation::Initialize)?;
        self.inner.initialize(endpoint_name, mode).await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        self.check(StoreOperation::Begin)?;
        Ok(Box::new(TestTransaction {
            inner: self.inner.begin().await?,
            store: self.clone(),
        }))
    }
}

struct TestTransaction {
    inner: Box<dyn StoreTransaction>,
    store: TestDelayedMessageStore,
}

#[async_trait]
impl StoreTransaction for TestTransaction {
    fn id(&self) -> TransactionId {
        self.inner.id()
    }

    async fn store(&mut self, message: DelayedMessage) -> Result<()> {
        self.store.check(StoreOperation::Store)?;
        self.inner.store(message).await
    }

    async fn next(&mut self) -> Result<Option<DateTime<Utc>>> {
        self.store.check(StoreOperation::Next)?;
        self.inner.next().await
    }

    async fn fetch_next_due_excluding(
        &mut self,
        at: DateTime<Utc>,
        excluded: &[String],
    ) -> Result<Option<DelayedMessage>> {
        self.store.check(StoreOperation::FetchNextDue)?;
        self.inner.fetch_next_due_excluding(at, excluded).await
    }

    async fn remove(&mut self, message: &DelayedMessage) -> Result<bool> {
        self.store.check(StoreOperation::Remove)?;
        self.inner.remove(message).await
    }

    async fn increment_failure_count(&mut self, message: &DelayedMessage) -> Result<bool> {
        self.store.check(StoreOperation::IncrementFailureCount)?;
        self.inner.increment_failure_count(message).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { inner, store } = *self;
        if let Err(e) = store.check(StoreOperation::Commit) {
            inner.rollback().await?;
            return Err(e);
        }

        inner.commit().await?;
        store.notify.notify_waiters();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self { inner, store } = *self;
        inner.rollback().await?;
        store.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn message(id: &str) -> DelayedMessage {
        DelayedMessage::new(id, "orders", Utc::now(), Vec::new(), Vec::new())
    }

    #[tokio::test]
    async fn test_injected_failure_counts_down() {
        let store = TestDelayedMessageStore::new();
        store.fail(StoreOperation::Begin, 2);

        assert!(store.begin().await.is_err());
        assert!(store.begin().await.is_err());
        assert!(store.begin().await.is_ok());
        assert_eq!(store.calls(StoreOperation::Begin), 3);
    }

    #[tokio::test]
    async fn test_fail_always_until_healed() {
        let store = TestDelayedMessageStore::new();
        store.fail_always(StoreOperation::Store);

        for _ in 0..5 {
            let mut tx = store.begin().await.expect("begin");
            let err = tx.store(message("a")).await.expect_err("injected");
            assert!(matches!(err, StoreError::Injected(_)));
        }

        store.heal();
        let mut tx = store.begin().await.expect("begin");
        tx.store(message("a")).await.expect("store");
        tx.commit().await.expect("commit");
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_discards_changes() {
        let store = TestDelayedMessageStore::new();
        store.fail(StoreOperation::Commit, 1);

        let mut tx = store.begin().await.expect("begin");
        tx.store(message("a")).await.expect("store");
        assert!(tx.commit().await.is_err());
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_count() {
        let store = TestDelayedMessageStore::new();
        let writer = store.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut tx = writer.begin().await.expect("begin");
            tx.store(message("a")).await.expect("store");
            tx.commit().await.expect("commit");
        });

        store
            .wait_for_count(1, Duration::from_secs(5))
            .await
            .expect("entry stored");
        assert!(
            store
                .wait_until_empty(Duration::from_millis(20))
                .await
                .is_err()
        );
    }
}
