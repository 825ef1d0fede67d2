//! Delayed delivery: holding messages until they are due, then sending them.
//!
//! The [`DelayedDeliveryPump`] receives tagged deliver-later messages from
//! the endpoint's timeouts queue and stores them, and the
//! [`DueDelayedMessagePoller`] dispatches stored entries once they fall due.
//! Both report prolonged failures to the host through circuit breakers and
//! a [`CriticalError`] callback.

pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod poller;
pub mod pump;
pub mod receiver;

pub use circuit_breaker::{
    CircuitBreakerStats, CriticalError, FailureRateCircuitBreaker, LogCriticalError,
    RepeatedFailuresOverTimeCircuitBreaker,
};
pub use config::DelayedDeliveryConfig;
pub use dispatcher::{Dispatcher, MessageDispatcher, OutgoingMessage, TransportTransaction};
pub use error::{DelayedDeliveryError, DispatchError, Result, SharedError};
pub use poller::DueDelayedMessagePoller;
pub use pump::{DelayedDeliveryPump, format_deliver_at, parse_deliver_at};
pub use receiver::{
    ChannelReceiver, ErrorContext, ErrorHandleResult, IncomingMessage, MessageContext,
    MessageReceiver, OnError, OnMessage, PushSettings,
};
