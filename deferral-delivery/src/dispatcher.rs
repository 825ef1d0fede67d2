//! Sending messages on behalf of the poller and the pump
//!
//! [`Dispatcher`] is the transport's narrow send capability. The
//! [`MessageDispatcher`] facade sits on top of it and knows how to turn a
//! stored entry back into an outgoing message, and how to dress a failed
//! message up with fault headers before it goes to the error queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deferral_common::{Headers, TransactionMode, headers, outgoing};
use deferral_store::{DelayedMessage, TransactionId, decode_headers};

use crate::{
    DelayedDeliveryError, DispatchError, Result, SharedError,
    error::{error_causes, error_kind},
};

/// A message ready to be handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    pub fn new(message_id: impl Into<String>, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            headers,
            body,
        }
    }
}

/// Explicit transaction context for a send
///
/// Passed down the call chain instead of relying on ambient state. When the
/// endpoint's mode lets dispatch share a unit of work with the store, the
/// store transaction the send belongs to is recorded here so the transport
/// can enlist in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTransaction {
    mode: TransactionMode,
    store_transaction: Option<TransactionId>,
}

impl TransportTransaction {
    /// A send that does not share a unit of work with any store transaction
    #[must_use]
    pub const fn new(mode: TransactionMode) -> Self {
        Self {
            mode,
            store_transaction: None,
        }
    }

    /// A send made while `store_transaction` is open, enlisted in it when the
    /// mode allows
    #[must_use]
    pub const fn within(mode: TransactionMode, store_transaction: TransactionId) -> Self {
        Self {
            mode,
            store_transaction: if mode.spans_dispatch() {
                Some(store_transaction)
            } else {
                None
            },
        }
    }

    #[must_use]
    pub const fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Store transaction this send is enlisted in, if any
    #[must_use]
    pub const fn store_transaction(&self) -> Option<TransactionId> {
        self.store_transaction
    }
}

/// Transport send capability
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Send one message to `destination`
    ///
    /// # Errors
    /// [`DispatchError::QueueNotFound`] when the destination does not exist,
    /// otherwise any transport failure
    async fn dispatch(
        &self,
        message: OutgoingMessage,
        destination: &str,
        transaction: &TransportTransaction,
    ) -> std::result::Result<(), DispatchError>;
}

/// Facade used by the poller and the pump to send messages
#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Arc<dyn Dispatcher>,
    error_queue: String,
    source_queue: String,
    fault_metadata: Headers,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("error_queue", &self.error_queue)
            .field("source_queue", &self.source_queue)
            .finish_non_exhaustive()
    }
}

impl MessageDispatcher {
    /// Wrap `inner`, forwarding failures to `error_queue` and naming
    /// `source_queue` as where they failed
    pub fn new(
        inner: Arc<dyn Dispatcher>,
        error_queue: impl Into<String>,
        source_queue: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            error_queue: error_queue.into(),
            source_queue: source_queue.into(),
            fault_metadata: Headers::default(),
        }
    }

    /// Static headers attached to everything forwarded to the error queue
    #[must_use]
    pub fn with_fault_metadata(mut self, fault_metadata: Headers) -> Self {
        self.fault_metadata = fault_metadata;
        self
    }

    #[must_use]
    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }

    /// Send a stored entry to its destination
    ///
    /// # Errors
    /// If the header blob cannot be decoded or the send fails
    pub async fn dispatch_delayed(
        &self,
        message: &DelayedMessage,
        transaction: &TransportTransaction,
    ) -> Result<()> {
        let headers = decode_headers(message.headers())?;
        self.dispatch_immediate(
            OutgoingMessage::new(message.message_id(), headers, message.body().to_vec()),
            message.destination(),
            transaction,
        )
        .await
    }

    /// Send a message straight to `destination`
    ///
    /// # Errors
    /// If the send fails
    pub async fn dispatch_immediate(
        &self,
        message: OutgoingMessage,
        destination: &str,
        transaction: &TransportTransaction,
    ) -> Result<()> {
        outgoing!(
            level = DEBUG,
            "Dispatching {} to {destination}",
            message.message_id
        );
        self.inner
            .dispatch(message, destination, transaction)
            .await
            .map_err(DelayedDeliveryError::from)
    }

    /// Forward a stored entry to the error queue with fault headers attached
    ///
    /// # Errors
    /// If the header blob cannot be decoded or the send fails
    pub async fn forward_delayed_to_error_queue(
        &self,
        message: &DelayedMessage,
        error: &SharedError,
        source: &str,
        transaction: &TransportTransaction,
    ) -> Result<()> {
        // A corrupt header blob must not stop the payload reaching the error queue
        let headers = decode_headers(message.headers()).unwrap_or_else(|e| {
            outgoing!(
                level = WARN,
                "Header blob of {} unreadable, forwarding without original headers: {e}",
                message.message_id()
            );
            Headers::default()
        });

        self.forward_to_error_queue(
            OutgoingMessage::new(message.message_id(), headers, message.body().to_vec()),
            error,
            source,
            transaction,
        )
        .await
    }

    /// Forward a message to the error queue with fault headers attached
    ///
    /// # Errors
    /// If the send fails
    pub async fn forward_to_error_queue(
        &self,
        mut message: OutgoingMessage,
        error: &SharedError,
        source: &str,
        transaction: &TransportTransaction,
    ) -> Result<()> {
        self.add_fault_headers(&mut message.headers, error, source);

        outgoing!(
            level = WARN,
            "Forwarding {} to error queue {}",
            message.message_id,
            self.error_queue
        );
        self.inner
            .dispatch(message, &self.error_queue, transaction)
            .await
            .map_err(DelayedDeliveryError::from)
    }

    fn add_fault_headers(&self, target: &mut Headers, error: &SharedError, source: &str) {
        for (key, value) in &self.fault_metadata {
            target.insert(key.clone(), value.clone());
        }

        let error: &(dyn std::error::Error + 'static) = error.as_ref();
        target.insert(headers::FAILED_QUEUE.to_string(), self.source_queue.clone());
        target.insert(headers::TIME_OF_FAILURE.to_string(), Utc::now().to_rfc3339());
        target.insert(headers::EXCEPTION_TYPE.to_string(), error_kind(error).to_string());
        target.insert(headers::EXCEPTION_MESSAGE.to_string(), error.to_string());
        target.insert(headers::EXCEPTION_SOURCE.to_string(), source.to_string());

        if let Some(causes) = error_causes(error) {
            target.insert(headers::EXCEPTION_CAUSES.to_string(), causes);
        }
    }
}
