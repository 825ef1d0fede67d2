use chrono::{DateTime, Utc};
use deferral_common::Headers;

use crate::error::SerializationError;

/// A message waiting in storage for its due time.
///
/// The due time is fixed at creation. The only state that changes while an
/// entry sits in the store is its failure count, which the store bumps on
/// [`crate::StoreTransaction::increment_failure_count`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedMessage {
    message_id: String,
    destination: String,
    time: DateTime<Utc>,
    headers: Vec<u8>,
    body: Vec<u8>,
    number_of_retries: u32,
}

impl DelayedMessage {
    /// Create a new entry with no recorded failures
    pub fn new(
        message_id: impl Into<String>,
        destination: impl Into<String>,
        time: DateTime<Utc>,
        headers: Vec<u8>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            destination: destination.into(),
            time,
            headers,
            body,
            number_of_retries: 0,
        }
    }

    /// Rebuild an entry as read back from a backend
    #[must_use]
    pub(crate) fn with_retries(mut self, number_of_retries: u32) -> Self {
        self.number_of_retries = number_of_retries;
        self
    }

    pub(crate) fn increment_retries(&mut self) {
        self.number_of_retries = self.number_of_retries.saturating_add(1);
    }

    pub(crate) fn decrement_retries(&mut self) {
        self.number_of_retries = self.number_of_retries.saturating_sub(1);
    }

    /// Storage key, derived from the native id of the tagged message
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Address to dispatch to once due
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Absolute UTC due time
    #[must_use]
    pub const fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Serialized header blob, scheduling headers already stripped
    #[must_use]
    pub fn headers(&self) -> &[u8] {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of failed dispatch attempts recorded so far
    #[must_use]
    pub const fn number_of_retries(&self) -> u32 {
        self.number_of_retries
    }

    /// Whether the entry may be dispatched at `at`
    #[must_use]
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        self.time <= at
    }
}

/// Serialize headers into the blob stored alongside a delayed message
///
/// # Errors
/// If bincode cannot encode the map
pub fn encode_headers(headers: &Headers) -> Result<Vec<u8>, SerializationError> {
    Ok(bincode::serde::encode_to_vec(
        headers,
        bincode::config::standard(),
    )?)
}

/// Deserialize a header blob produced by [`encode_headers`]
///
/// An empty blob decodes to an empty map.
///
/// # Errors
/// If the blob is corrupted
pub fn decode_headers(bytes: &[u8]) -> Result<Headers, SerializationError> {
    if bytes.is_empty() {
        return Ok(Headers::default());
    }

    let (headers, _) =
        bincode::serde::decode_from_slice::<Headers, _>(bytes, bincode::config::standard())?;
    Ok(headers)
}
