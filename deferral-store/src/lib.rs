//! Durable storage for delayed messages.
//!
//! A [`DelayedMessageStore`] keeps every message that was asked to be
//! delivered later, keyed by its native message id, until the poller
//! dispatches it or forwards it to an error queue. Backends are chosen at
//! configuration time through [`StoreConfig`].

pub mod backends;
pub mod config;
pub mod error;
pub mod message;
pub mod store;

pub use backends::{
    MemoryDelayedMessageStore, SqliteDelayedMessageStore, StoreOperation,
    TestDelayedMessageStore,
};
pub use config::StoreConfig;
pub use error::{Result, SerializationError, StoreError};
pub use message::{DelayedMessage, decode_headers, encode_headers};
pub use store::{DelayedMessageStore, StoreTransaction, TransactionId};
