//! The receive side the pump plugs into
//!
//! A [`MessageReceiver`] delivers inbound messages to an [`OnMessage`]
//! handler and reports handler failures to an [`OnError`] handler, which
//! decides between retrying immediately and treating the message as handled.
//!
//! [`ChannelReceiver`] is an in-process receiver fed through a tokio channel.

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use deferral_common::{Headers, TransactionMode, internal};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{DelayedDeliveryError, Result, SharedError, TransportTransaction};

/// A message as received from the input queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl IncomingMessage {
    pub fn new(message_id: impl Into<String>, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            headers,
            body,
        }
    }
}

/// Everything a handler needs to process one received message
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message: IncomingMessage,
    pub receive_address: String,
    pub transaction: TransportTransaction,
}

/// A handler failure, with the number of times the message has failed so far
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error: SharedError,
    pub message: IncomingMessage,
    pub immediate_processing_failures: u32,
    pub receive_address: String,
    pub transaction: TransportTransaction,
}

/// What the receiver should do after a handler failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// The failure was dealt with; consume the message
    Handled,
    /// Hand the message to the message handler again
    RetryRequired,
}

/// Settings the receiver is initialized with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSettings {
    pub input_queue: String,
    pub error_queue: String,
    pub transaction_mode: TransactionMode,
    /// Maximum number of messages handed to the handler at once
    pub concurrency: usize,
}

#[async_trait]
pub trait OnMessage: Send + Sync {
    /// Process one message
    ///
    /// # Errors
    /// Any failure; the receiver reports it to [`OnError`]
    async fn on_message(&self, context: MessageContext, cancel: CancellationToken) -> Result<()>;
}

#[async_trait]
pub trait OnError: Send + Sync {
    async fn on_error(&self, context: ErrorContext, cancel: CancellationToken)
    -> ErrorHandleResult;
}

/// Receive-pump capability
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Register the handlers and settings; must precede [`Self::start_receive`]
    ///
    /// # Errors
    /// If the input queue cannot be prepared
    async fn initialize(
        &self,
        settings: PushSettings,
        on_message: Arc<dyn OnMessage>,
        on_error: Arc<dyn OnError>,
    ) -> Result<()>;

    /// Start delivering messages to the handlers
    ///
    /// # Errors
    /// If the receiver was not initialized or is already running
    async fn start_receive(&self) -> Result<()>;

    /// Stop taking new messages and wait for in-flight ones to finish
    ///
    /// # Errors
    /// If the receive loop failed
    async fn stop_receive(&self) -> Result<()>;
}

struct Handlers {
    settings: PushSettings,
    on_message: Arc<dyn OnMessage>,
    on_error: Arc<dyn OnError>,
}

/// The receive channel, handed between the receiver and its running loop
struct Inbox {
    receiver: mpsc::Receiver<IncomingMessage>,
    /// Messages a stop interrupted; handled first on the next start
    unfinished: VecDeque<IncomingMessage>,
}

#[derive(Default)]
struct ChannelState {
    handlers: Option<Arc<Handlers>>,
    inbox: Option<Inbox>,
    running: Option<(CancellationToken, tokio::task::JoinHandle<Inbox>)>,
}

/// In-process [`MessageReceiver`] backed by a bounded tokio channel
///
/// Up to [`PushSettings::concurrency`] messages are handled at once. A
/// failing message is retried in place until the error handler reports it
/// handled. A message still being retried when the receiver stops is kept
/// and handled again once the receiver restarts.
pub struct ChannelReceiver {
    sender: mpsc::Sender<IncomingMessage>,
    state: Mutex<ChannelState>,
    span: tracing::Span,
}

impl std::fmt::Debug for ChannelReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("unfinished", &self.unfinished())
            .finish_non_exhaustive()
    }
}

impl ChannelReceiver {
    /// Create a receiver buffering up to `capacity` messages
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            state: Mutex::new(ChannelState {
                inbox: Some(Inbox {
                    receiver,
                    unfinished: VecDeque::new(),
                }),
                ..ChannelState::default()
            }),
            span: tracing::info_span!(target: "deferral", "receiver"),
        }
    }

    /// Messages interrupted by the last stop that wait for the next start
    #[must_use]
    pub fn unfinished(&self) -> usize {
        self.state
            .lock()
            .inbox
            .as_ref()
            .map_or(0, |inbox| inbox.unfinished.len())
    }

    /// Replace the span the receive loop runs in
    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Handle for feeding messages into the receiver
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<IncomingMessage> {
        self.sender.clone()
    }

    async fn run(handlers: Arc<Handlers>, mut inbox: Inbox, cancel: CancellationToken) -> Inbox {
        let concurrency = handlers.settings.concurrency.max(1);
        let mut backlog = std::mem::take(&mut inbox.unfinished);
        let mut unfinished = VecDeque::new();
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.len() >= concurrency {
                if let Some(result) = in_flight.join_next().await {
                    Self::collect(result, &mut unfinished);
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let message = match backlog.pop_front() {
                Some(message) => message,
                None => tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                        Self::collect(result, &mut unfinished);
                        continue;
                    }
                    message = inbox.receiver.recv() => {
                        let Some(message) = message else {
                            internal!(level = DEBUG, "Receive channel closed");
                            break;
                        };
                        message
                    }
                },
            };

            let handlers = Arc::clone(&handlers);
            let cancel = cancel.clone();
            in_flight.spawn(
                async move { Self::process(&handlers, message, &cancel).await }
                    .in_current_span(),
            );
        }

        while let Some(result) = in_flight.join_next().await {
            Self::collect(result, &mut unfinished);
        }
        unfinished.extend(backlog);

        if !unfinished.is_empty() {
            internal!(
                level = WARN,
                "Keeping {} unfinished message(s) for the next start",
                unfinished.len()
            );
        }
        inbox.unfinished = unfinished;
        inbox
    }

    fn collect(
        result: std::result::Result<Option<IncomingMessage>, JoinError>,
        unfinished: &mut VecDeque<IncomingMessage>,
    ) {
        match result {
            Ok(Some(message)) => unfinished.push_back(message),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "Message handler task failed"),
        }
    }

    /// Hand `message` to the handlers until it is done with.
    ///
    /// Returns the message if shutdown interrupted it before it was handled.
    async fn process(
        handlers: &Handlers,
        message: IncomingMessage,
        cancel: &CancellationToken,
    ) -> Option<IncomingMessage> {
        let transaction = TransportTransaction::new(handlers.settings.transaction_mode);
        let mut failures = 0_u32;

        loop {
            let context = MessageContext {
                message: message.clone(),
                receive_address: handlers.settings.input_queue.clone(),
                transaction,
            };

            let Err(error) = handlers.on_message.on_message(context, cancel.clone()).await else {
                return None;
            };

            if error.is_cancelled() {
                internal!(
                    level = DEBUG,
                    "Putting {} back during shutdown",
                    message.message_id
                );
                return Some(message);
            }

            failures = failures.saturating_add(1);
            let context = ErrorContext {
                error: error.shared(),
                message: message.clone(),
                immediate_processing_failures: failures,
                receive_address: handlers.settings.input_queue.clone(),
                transaction,
            };

            match handlers.on_error.on_error(context, cancel.clone()).await {
                ErrorHandleResult::Handled => return None,
                ErrorHandleResult::RetryRequired if cancel.is_cancelled() => {
                    internal!(
                        level = DEBUG,
                        "Putting {} back after {failures} failure(s) during shutdown",
                        message.message_id
                    );
                    return Some(message);
                }
                ErrorHandleResult::RetryRequired => {}
            }
        }
    }
}

#[async_trait]
impl MessageReceiver for ChannelReceiver {
    async fn initialize(
        &self,
        settings: PushSettings,
        on_message: Arc<dyn OnMessage>,
        on_error: Arc<dyn OnError>,
    ) -> Result<()> {
        internal!(
            level = DEBUG,
            "Receiver initialized for {}",
            settings.input_queue
        );
        self.state.lock().handlers = Some(Arc::new(Handlers {
            settings,
            on_message,
            on_error,
        }));
        Ok(())
    }

    async fn start_receive(&self) -> Result<()> {
        let mut state = self.state.lock();

        let handlers = state
            .handlers
            .clone()
            .ok_or_else(|| DelayedDeliveryError::Receiver("Receiver not initialized".to_string()))?;
        let inbox = state
            .inbox
            .take()
            .ok_or_else(|| DelayedDeliveryError::Receiver("Receiver already running".to_string()))?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            Self::run(handlers, inbox, cancel.clone()).instrument(self.span.clone()),
        );

        state.running = Some((cancel, handle));
        Ok(())
    }

    async fn stop_receive(&self) -> Result<()> {
        let running = self.state.lock().running.take();
        let Some((cancel, handle)) = running else {
            return Ok(());
        };

        cancel.cancel();
        let inbox = handle
            .await
            .map_err(|e| DelayedDeliveryError::Receiver(format!("Receive loop failed: {e}")))?;

        // The loop hands the channel back so the receiver can be restarted
        self.state.lock().inbox = Some(inbox);

        internal!(level = DEBUG, "Receiver stopped");
        Ok(())
    }
}
