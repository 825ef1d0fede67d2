//! Shared fixtures for the delayed delivery integration tests

#![allow(dead_code, clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferral_common::Headers;
use deferral_delivery::{
    CriticalError, DelayedDeliveryConfig, DispatchError, Dispatcher, OutgoingMessage, SharedError,
    TransportTransaction,
};
use deferral_store::{DelayedMessage, DelayedMessageStore, encode_headers};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const ENDPOINT: &str = "Sales";
pub const ERROR_QUEUE: &str = "error";

/// A send recorded by [`RecordingDispatcher`]
#[derive(Debug, Clone)]
pub struct Sent {
    pub destination: String,
    pub message: OutgoingMessage,
    pub transaction: TransportTransaction,
}

/// Dispatcher that records sends and fails on demand per destination
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<Sent>>,
    attempts: Mutex<AHashMap<String, usize>>,
    /// Remaining failures per destination (None = always)
    failures: Mutex<AHashMap<String, Option<usize>>>,
    missing: Mutex<AHashSet<String>>,
    notify: Notify,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, destination: &str, times: usize) {
        self.failures
            .lock()
            .insert(destination.to_string(), Some(times));
    }

    pub fn fail_always(&self, destination: &str) {
        self.failures.lock().insert(destination.to_string(), None);
    }

    pub fn missing_queue(&self, destination: &str) {
        self.missing.lock().insert(destination.to_string());
    }

    pub fn attempts(&self, destination: &str) -> usize {
        self.attempts
            .lock()
            .get(destination)
            .copied()
            .unwrap_or_default()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<Sent> {
        self.sent
            .lock()
            .iter()
            .filter(|sent| sent.destination == destination)
            .cloned()
            .collect()
    }

    /// Wait until `count` messages have been sent to `destination`
    pub async fn wait_for(&self, destination: &str, count: usize, timeout: Duration) -> Vec<Sent> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let sent = self.sent_to(destination);
                if sent.len() >= count {
                    return sent;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "Timed out waiting for {count} message(s) to {destination}, got {}",
                self.sent_to(destination).len()
            )
        })
    }

    fn should_fail(&self, destination: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(destination) {
            None => false,
            Some(None) => true,
            Some(Some(remaining)) => {
                if *remaining == 0 {
                    failures.remove(destination);
                    return false;
                }
                *remaining -= 1;
                true
            }
        }
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        message: OutgoingMessage,
        destination: &str,
        transaction: &TransportTransaction,
    ) -> Result<(), DispatchError> {
        *self
            .attempts
            .lock()
            .entry(destination.to_string())
            .or_default() += 1;

        if self.missing.lock().contains(destination) {
            return Err(DispatchError::QueueNotFound(destination.to_string()));
        }

        if self.should_fail(destination) {
            return Err(DispatchError::Transport(format!(
                "Injected failure sending to {destination}"
            )));
        }

        self.sent.lock().push(Sent {
            destination: destination.to_string(),
            message,
            transaction: *transaction,
        });
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Records every raised critical error
#[derive(Default)]
pub struct RecordingCriticalError {
    raised: Mutex<Vec<(String, String)>>,
    notify: Notify,
}

impl RecordingCriticalError {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raised(&self) -> Vec<(String, String)> {
        self.raised.lock().clone()
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<(String, String)> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let raised = self.raised();
                if raised.len() >= count {
                    return raised;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {count} critical error(s)"))
    }
}

#[async_trait]
impl CriticalError for RecordingCriticalError {
    async fn raise(
        &self,
        description: &str,
        error: SharedError,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.raised
            .lock()
            .push((description.to_string(), error.to_string()));
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Configuration tuned for fast tests
pub fn config() -> DelayedDeliveryConfig {
    let mut config = DelayedDeliveryConfig::new(ENDPOINT, ERROR_QUEUE);
    config.failure_backoff_millis = 10;
    config.max_sleep_millis = 30_000;
    config
}

pub fn headers(pairs: &[(&str, &str)]) -> Headers {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect()
}

pub fn delayed(id: &str, destination: &str, time: DateTime<Utc>) -> DelayedMessage {
    DelayedMessage::new(
        id,
        destination,
        time,
        encode_headers(&headers(&[("Content-Type", "text/plain")])).expect("encode"),
        format!("payload of {id}").into_bytes(),
    )
}

pub async fn store_committed(store: &dyn DelayedMessageStore, message: DelayedMessage) {
    let mut transaction = store.begin().await.expect("begin");
    transaction.store(message).await.expect("store");
    transaction.commit().await.expect("commit");
}
