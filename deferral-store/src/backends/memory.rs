use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferral_common::TransactionMode;
use parking_lot::Mutex;

use crate::{
    DelayedMessage, Result, StoreError,
    store::{DelayedMessageStore, StoreTransaction, TransactionId},
};

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, DelayedMessage>,
    /// Message ids currently claimed, with the transaction holding each claim
    claims: HashMap<String, TransactionId>,
    /// Entries stored by a transaction that has not committed yet
    pending: HashMap<String, TransactionId>,
}

impl State {
    /// Whether `transaction` may see the entry: committed entries are seen
    /// by everyone, uncommitted ones only by the transaction that stored them
    fn visible_to(&self, message_id: &str, transaction: TransactionId) -> bool {
        self.pending
            .get(message_id)
            .is_none_or(|owner| *owner == transaction)
    }

    fn committed(&self) -> impl Iterator<Item = &DelayedMessage> {
        self.entries
            .values()
            .filter(|message| !self.pending.contains_key(message.message_id()))
    }
}

/// In-memory delayed message store
///
/// Entries live in a `HashMap` behind a `parking_lot` mutex. Writes apply
/// immediately and are recorded in a per-transaction undo log, which is
/// replayed in reverse on rollback. Entries stored by a transaction stay
/// invisible to every other transaction until it commits, and claims made by
/// `fetch_next_due` hide an entry from other transactions until the claiming
/// transaction finishes.
///
/// Intended for tests and single-process hosts that accept losing pending
/// entries on restart.
///
/// # Capacity Management
/// An optional capacity bounds the number of stored entries; `store` fails
/// with [`StoreError::CapacityExceeded`] once it is reached.
#[derive(Debug, Clone, Default)]
pub struct MemoryDelayedMessageStore {
    state: Arc<Mutex<State>>,
    /// Maximum number of entries to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryDelayedMessageStore {
    /// Create a new empty store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty store that holds at most `capacity` entries
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Get the configured capacity (None = unlimited)
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of committed entries, claimed or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().committed().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a committed entry with this message id is stored
    #[must_use]
    pub fn contains(&self, message_id: &str) -> bool {
        self.get(message_id).is_some()
    }

    /// Snapshot of a committed entry
    #[must_use]
    pub fn get(&self, message_id: &str) -> Option<DelayedMessage> {
        let state = self.state.lock();
        if state.pending.contains_key(message_id) {
            return None;
        }
        state.entries.get(message_id).cloned()
    }

    /// Remove every entry and claim
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.claims.clear();
        state.pending.clear();
    }
}

#[async_trait]
impl DelayedMessageStore for MemoryDelayedMessageStore {
    async fn initialize(&self, endpoint_name: &str, mode: TransactionMode) -> Result<()> {
        tracing::debug!(endpoint = endpoint_name, %mode, "Using in-memory delayed message store");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            id: TransactionId::generate(),
            state: Arc::clone(&self.state),
            capacity: self.capacity,
            undo: Vec::new(),
            claimed: HashSet::new(),
            finished: false,
        }))
    }
}

#[derive(Debug)]
enum Undo {
    Stored(String),
    Removed(DelayedMessage),
    Incremented(String),
}

struct MemoryTransaction {
    id: TransactionId,
    state: Arc<Mutex<State>>,
    capacity: Option<usize>,
    undo: Vec<Undo>,
    claimed: HashSet<String>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> Result<()> {
        if self.finished {
            Err(StoreError::TransactionFinished(self.id.to_string()))
        } else {
            Ok(())
        }
    }

    /// Drop this transaction's claims and publish what it stored
    fn release(&mut self, state: &mut State) {
        for message_id in self.claimed.drain() {
            if state.claims.get(&message_id) == Some(&self.id) {
                state.claims.remove(&message_id);
            }
        }
        state.pending.retain(|_, owner| *owner != self.id);
    }

    fn undo_all(&mut self) {
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock();
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Stored(message_id) => {
                    state.entries.remove(&message_id);
                    state.pending.remove(&message_id);
                }
                Undo::Removed(message) => {
                    state
                        .entries
                        .entry(message.message_id().to_string())
                        .or_insert(message);
                }
                Undo::Incremented(message_id) => {
                    if let Some(entry) = state.entries.get_mut(&message_id) {
                        entry.decrement_retries();
                    }
                }
            }
        }
        self.release(&mut state);
        self.finished = true;
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    async fn store(&mut self, message: DelayedMessage) -> Result<()> {
        self.ensure_active()?;
        let mut state = self.state.lock();

        if state.entries.contains_key(message.message_id()) {
            return Err(StoreError::AlreadyExists(message.message_id().to_string()));
        }

        if let Some(capacity) = self.capacity
            && state.entries.len() >= capacity
        {
            return Err(StoreError::CapacityExceeded {
                used: state.entries.len(),
                capacity,
            });
        }

        let message_id = message.message_id().to_string();
        state.entries.insert(message_id.clone(), message);
        state.pending.insert(message_id.clone(), self.id);
        self.undo.push(Undo::Stored(message_id));

        Ok(())
    }

    async fn next(&mut self) -> Result<Option<DateTime<Utc>>> {
        self.ensure_active()?;
        let state = self.state.lock();
        Ok(state
            .entries
            .values()
            .filter(|message| state.visible_to(message.message_id(), self.id))
            .map(DelayedMessage::time)
            .min())
    }

    async fn fetch_next_due_excluding(
        &mut self,
        at: DateTime<Utc>,
        excluded: &[String],
    ) -> Result<Option<DelayedMessage>> {
        self.ensure_active()?;
        let mut state = self.state.lock();

        let candidate = state
            .entries
            .values()
            .filter(|message| message.is_due(at))
            .filter(|message| state.visible_to(message.message_id(), self.id))
            .filter(|message| !state.claims.contains_key(message.message_id()))
            .filter(|message| !excluded.iter().any(|id| id == message.message_id()))
            .min_by(|a, b| {
                a.time()
                    .cmp(&b.time())
                    .then_with(|| a.message_id().cmp(b.message_id()))
            })
            .cloned();

        if let Some(message) = &candidate {
            let message_id = message.message_id().to_string();
            state.claims.insert(message_id.clone(), self.id);
            self.claimed.insert(message_id);
        }

        Ok(candidate)
    }

    async fn remove(&mut self, message: &DelayedMessage) -> Result<bool> {
        self.ensure_active()?;
        let mut state = self.state.lock();
        if !state.visible_to(message.message_id(), self.id) {
            return Ok(false);
        }
        let removed = state.entries.remove(message.message_id());

        Ok(removed.is_some_and(|removed| {
            self.undo.push(Undo::Removed(removed));
            true
        }))
    }

    async fn increment_failure_count(&mut self, message: &DelayedMessage) -> Result<bool> {
        self.ensure_active()?;
        let mut state = self.state.lock();
        if !state.visible_to(message.message_id(), self.id) {
            return Ok(false);
        }

        let Some(entry) = state.entries.get_mut(message.message_id()) else {
            return Ok(false);
        };
        entry.increment_retries();
        self.undo
            .push(Undo::Incremented(message.message_id().to_string()));

        Ok(true)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.ensure_active()?;
        self.undo.clear();
        let state = Arc::clone(&self.state);
        self.release(&mut state.lock());
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.ensure_active()?;
        self.undo_all();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::trace!(transaction = %self.id, "Rolling back abandoned transaction");
            self.undo_all();
        }
    }
}
