//! Accepting deliver-later requests
//!
//! Tagged messages arrive on the endpoint's timeouts queue carrying a
//! deliver-at time and a destination in their headers. The pump strips
//! those headers and either dispatches the message straight away, when it
//! is already due, or stores it and signals the poller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferral_common::{Headers, TransactionMode, headers, internal};
use deferral_store::{DelayedMessage, DelayedMessageStore, StoreError, encode_headers};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    CriticalError, DelayedDeliveryConfig, DelayedDeliveryError, Dispatcher,
    DueDelayedMessagePoller, MessageDispatcher, RepeatedFailuresOverTimeCircuitBreaker, Result,
    circuit_breaker::raise_critical_error,
    dispatcher::OutgoingMessage,
    receiver::{
        ErrorContext, ErrorHandleResult, MessageContext, MessageReceiver, OnError, OnMessage,
        PushSettings,
    },
};

/// Name recorded as the fault source of tagged messages the pump gives up on
pub const FAULT_SOURCE: &str = "DelayedDeliveryPump";

/// Parse the deliver-at header value
///
/// # Errors
/// If the value is not an RFC 3339 timestamp
pub fn parse_deliver_at(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| DelayedDeliveryError::InvalidDeliverAt {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Format a due time the way [`parse_deliver_at`] reads it
#[must_use]
pub fn format_deliver_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

struct Handler {
    store: Arc<dyn DelayedMessageStore>,
    dispatcher: MessageDispatcher,
    poller: Arc<DueDelayedMessagePoller>,
    store_breaker: RepeatedFailuresOverTimeCircuitBreaker,
    critical_error: Arc<dyn CriticalError>,
    number_of_retries: u32,
    /// Interrupts breaker back-off once the pump is stopping
    shutdown: Mutex<CancellationToken>,
}

/// Receives tagged deliver-later messages and hands them to storage or
/// straight to their destination
pub struct DelayedDeliveryPump {
    handler: Arc<Handler>,
    receiver: Arc<dyn MessageReceiver>,
    settings: PushSettings,
    endpoint_name: String,
    transaction_mode: TransactionMode,
    span: tracing::Span,
}

impl std::fmt::Debug for DelayedDeliveryPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedDeliveryPump")
            .field("endpoint_name", &self.endpoint_name)
            .field("settings", &self.settings)
            .field("poller", &self.handler.poller)
            .finish_non_exhaustive()
    }
}

impl DelayedDeliveryPump {
    /// Build the pump and its poller, taking the store from `config`
    ///
    /// # Errors
    /// If the configuration is invalid
    pub fn from_config(
        config: &DelayedDeliveryConfig,
        dispatcher: Arc<dyn Dispatcher>,
        receiver: Arc<dyn MessageReceiver>,
        critical_error: Arc<dyn CriticalError>,
    ) -> Result<Self> {
        config.validate()?;
        let store = config.store.clone().into_store();
        Ok(Self::new(config, store, dispatcher, receiver, critical_error))
    }

    /// Build the pump and its poller around an existing store
    pub fn new(
        config: &DelayedDeliveryConfig,
        store: Arc<dyn DelayedMessageStore>,
        dispatcher: Arc<dyn Dispatcher>,
        receiver: Arc<dyn MessageReceiver>,
        critical_error: Arc<dyn CriticalError>,
    ) -> Self {
        let timeouts_queue = config.timeouts_queue();
        let dispatcher = MessageDispatcher::new(dispatcher, &config.error_queue, &timeouts_queue)
            .with_fault_metadata(config.fault_metadata.clone());

        let span = tracing::info_span!(
            target: "deferral",
            "delayed_delivery",
            endpoint = %config.endpoint_name
        );
        let poller = DueDelayedMessagePoller::new(
            config,
            Arc::clone(&store),
            dispatcher.clone(),
            &critical_error,
        )
        .with_span(tracing::info_span!(target: "deferral", parent: &span, "poller"));

        Self {
            handler: Arc::new(Handler {
                store,
                dispatcher,
                poller: Arc::new(poller),
                store_breaker: RepeatedFailuresOverTimeCircuitBreaker::new(
                    "DelayedDeliveryStore",
                    config.time_to_trigger_store_circuit_breaker(),
                    config.failure_backoff(),
                    Arc::clone(&critical_error),
                ),
                critical_error,
                number_of_retries: config.number_of_retries,
                shutdown: Mutex::new(CancellationToken::new()),
            }),
            receiver,
            settings: PushSettings {
                input_queue: timeouts_queue,
                error_queue: config.error_queue.clone(),
                transaction_mode: config.transaction_mode,
                concurrency: config.concurrency,
            },
            endpoint_name: config.endpoint_name.clone(),
            transaction_mode: config.transaction_mode,
            span,
        }
    }

    /// The poller this pump feeds
    #[must_use]
    pub fn poller(&self) -> &Arc<DueDelayedMessagePoller> {
        &self.handler.poller
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DelayedMessageStore> {
        &self.handler.store
    }

    /// Queue the tagged messages are received from
    #[must_use]
    pub fn input_queue(&self) -> &str {
        &self.settings.input_queue
    }

    /// Initialize the store, start receiving, then start the poller
    ///
    /// # Errors
    /// If the store cannot be initialized or the receiver cannot start
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        async {
            internal!(level = INFO, "Starting delayed delivery for {}", self.endpoint_name);
            *self.handler.shutdown.lock() = cancel.child_token();

            self.handler
                .store
                .initialize(&self.endpoint_name, self.transaction_mode)
                .await?;

            let handler = Arc::clone(&self.handler);
            self.receiver
                .initialize(
                    self.settings.clone(),
                    Arc::clone(&handler) as Arc<dyn OnMessage>,
                    handler as Arc<dyn OnError>,
                )
                .await?;
            self.receiver.start_receive().await?;

            self.handler.poller.start(cancel)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Stop receiving, then stop the poller and wait for it to exit
    ///
    /// # Errors
    /// If the receiver fails to stop; the poller is stopped regardless
    pub async fn stop(&self) -> Result<()> {
        async {
            internal!(level = INFO, "Stopping delayed delivery for {}", self.endpoint_name);

            self.handler.shutdown.lock().cancel();
            let receiver = self.receiver.stop_receive().await;
            self.handler.poller.stop().await;
            receiver
        }
        .instrument(self.span.clone())
        .await
    }
}

impl Handler {
    async fn store_entry(&self, message: DelayedMessage) -> std::result::Result<(), StoreError> {
        let mut transaction = self.store.begin().await?;
        match transaction.store(message).await {
            Ok(()) => transaction.commit().await,
            Err(e) if e.is_already_exists() => {
                transaction.rollback().await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl OnMessage for Handler {
    async fn on_message(&self, context: MessageContext, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() || self.shutdown.lock().is_cancelled() {
            return Err(DelayedDeliveryError::Cancelled);
        }

        let MessageContext {
            message,
            transaction,
            ..
        } = context;
        let mut message_headers: Headers = message.headers;
        let (deliver_at, destination) = headers::take_scheduling(&mut message_headers);

        let destination =
            destination.ok_or(DelayedDeliveryError::MissingHeader(headers::DESTINATION))?;
        let deliver_at = parse_deliver_at(
            &deliver_at.ok_or(DelayedDeliveryError::MissingHeader(headers::DELIVER_AT))?,
        )?;

        if deliver_at <= Utc::now() {
            tracing::debug!(
                message_id = %message.message_id,
                destination = %destination,
                "Tagged message already due, dispatching immediately"
            );
            return self
                .dispatcher
                .dispatch_immediate(
                    OutgoingMessage::new(message.message_id, message_headers, message.body),
                    &destination,
                    &transaction,
                )
                .await;
        }

        let entry = DelayedMessage::new(
            message.message_id,
            destination,
            deliver_at,
            encode_headers(&message_headers)?,
            message.body,
        );
        let message_id = entry.message_id().to_string();

        match self.store_entry(entry).await {
            Ok(()) => self.store_breaker.success(),
            Err(e) if e.is_already_exists() => {
                tracing::debug!(message_id = %message_id, "Delayed message already stored");
                self.store_breaker.success();
            }
            Err(e) => {
                tracing::warn!(message_id = %message_id, error = %e, "Failed to store delayed message");
                let error = DelayedDeliveryError::from(e).shared();
                let shutdown = self.shutdown.lock().clone();
                self.store_breaker
                    .failure(Arc::clone(&error), &shutdown)
                    .await;
                return Err(DelayedDeliveryError::Shared(error));
            }
        }

        tracing::debug!(message_id = %message_id, due = %deliver_at, "Delayed message stored");
        self.poller.signal(deliver_at);
        Ok(())
    }
}

#[async_trait]
impl OnError for Handler {
    async fn on_error(&self, context: ErrorContext, cancel: CancellationToken) -> ErrorHandleResult {
        let ErrorContext {
            error,
            message,
            immediate_processing_failures,
            transaction,
            ..
        } = context;

        let malformed = error
            .downcast_ref::<DelayedDeliveryError>()
            .is_some_and(DelayedDeliveryError::is_invalid_input);

        // A failure caused by stopping is not the message's fault; the
        // receiver keeps it for the next start
        let stopping = cancel.is_cancelled() || self.shutdown.lock().is_cancelled();

        if !malformed && (stopping || immediate_processing_failures < self.number_of_retries) {
            tracing::debug!(
                message_id = %message.message_id,
                attempt = immediate_processing_failures,
                error = %error,
                "Retrying tagged message"
            );
            return ErrorHandleResult::RetryRequired;
        }

        let message_id = message.message_id.clone();
        let forwarded = self
            .dispatcher
            .forward_to_error_queue(
                OutgoingMessage::new(message.message_id, message.headers, message.body),
                &error,
                FAULT_SOURCE,
                &transaction,
            )
            .await;

        if let Err(e) = forwarded {
            tracing::error!(
                message_id = %message_id,
                error = %e,
                "Failed to move tagged message to the error queue, retrying"
            );
            return ErrorHandleResult::RetryRequired;
        }

        tracing::error!(
            message_id = %message_id,
            attempts = immediate_processing_failures,
            error = %error,
            "Tagged message moved to the error queue"
        );
        // A malformed request is the sender's problem, not an outage
        if !malformed {
            raise_critical_error(
                &self.critical_error,
                "Failed to store delayed message, moved to the error queue",
                error,
                cancel,
            )
            .await;
        }

        ErrorHandleResult::Handled
    }
}
