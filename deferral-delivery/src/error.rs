//! Typed error handling for delayed delivery.
//!
//! This module separates failures by how the poller and pump react to them:
//! - Destination errors (queue not found) skip the retry budget
//! - Transient errors (storage, transport) are retried and counted
//! - Input errors (missing or malformed scheduling headers) cannot succeed on retry

use std::sync::Arc;

use deferral_store::{SerializationError, StoreError};
use thiserror::Error;

/// An error shared between the component that saw it, the breakers and the
/// critical-error callback
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Top-level delayed delivery error type.
#[derive(Debug, Error)]
pub enum DelayedDeliveryError {
    /// The delayed message store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Handing a message to the transport failed.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Header blob could not be encoded or decoded.
    #[error("Header serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// A tagged message is missing a scheduling header.
    #[error("Missing scheduling header: {0}")]
    MissingHeader(&'static str),

    /// The deliver-at header could not be parsed.
    #[error("Invalid deliver-at value '{value}': {reason}")]
    InvalidDeliverAt { value: String, reason: String },

    /// The configuration could not be read or is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The configuration file could not be parsed.
    #[error("Configuration parse error: {0}")]
    ConfigurationParse(#[from] ron::error::SpannedError),

    /// I/O operation failed (reading configuration).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The receive side could not be driven.
    #[error("Receiver error: {0}")]
    Receiver(String),

    /// An error already shared with a breaker or callback.
    #[error(transparent)]
    Shared(SharedError),

    /// The operation was abandoned because shutdown was requested.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors reported by a [`crate::Dispatcher`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The destination queue does not exist.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The transport refused or failed the send.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The outgoing headers could not be represented by the transport.
    #[error("Invalid headers: {0}")]
    InvalidHeaders(String),
}

impl DispatchError {
    /// Returns `true` if the destination is permanently unreachable.
    #[must_use]
    pub const fn is_queue_not_found(&self) -> bool {
        matches!(self, Self::QueueNotFound(_))
    }

    /// Short, stable name used in fault headers
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::QueueNotFound(_) => "Dispatch.QueueNotFound",
            Self::Transport(_) => "Dispatch.Transport",
            Self::InvalidHeaders(_) => "Dispatch.InvalidHeaders",
        }
    }
}

impl DelayedDeliveryError {
    /// Returns `true` if retrying cannot help because the destination is gone.
    #[must_use]
    pub const fn is_queue_not_found(&self) -> bool {
        matches!(self, Self::Dispatch(e) if e.is_queue_not_found())
    }

    /// Returns `true` if this is an expected shutdown cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the tagged message itself is malformed.
    #[must_use]
    pub const fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::MissingHeader(_) | Self::InvalidDeliverAt { .. } | Self::Serialization(_)
        )
    }

    /// Short, stable name used in fault headers
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shared(e) => error_kind(e.as_ref()),
            Self::Store(_) => "Store",
            Self::Dispatch(e) => e.kind(),
            Self::Serialization(_) => "Serialization",
            Self::MissingHeader(_) => "MissingHeader",
            Self::InvalidDeliverAt { .. } => "InvalidDeliverAt",
            Self::Configuration(_) | Self::ConfigurationParse(_) => "Configuration",
            Self::Io(_) => "Io",
            Self::Receiver(_) => "Receiver",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Wrap this error so it can be handed to several observers
    #[must_use]
    pub fn shared(self) -> SharedError {
        Arc::new(self)
    }
}

/// Resolve a fault-header type name for any shared error
pub(crate) fn error_kind(error: &(dyn std::error::Error + 'static)) -> &'static str {
    if let Some(error) = error.downcast_ref::<DelayedDeliveryError>() {
        error.kind()
    } else if let Some(error) = error.downcast_ref::<DispatchError>() {
        error.kind()
    } else if error.downcast_ref::<StoreError>().is_some() {
        "Store"
    } else {
        "Unknown"
    }
}

/// Render the chain of sources below `error`, outermost first
pub(crate) fn error_causes(error: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut causes = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }

    (!causes.is_empty()).then(|| causes.join(" -> "))
}

/// Specialized `Result` type for delayed delivery operations.
pub type Result<T> = std::result::Result<T, DelayedDeliveryError>;
