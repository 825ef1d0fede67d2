//! Header keys understood by the delayed-delivery subsystem.
//!
//! Scheduling keys travel on the tagged message that asks for deferred
//! delivery and are stripped before the message is stored. Fault keys are
//! attached to anything forwarded to an error queue.

/// Message headers as carried between the host and the transport
pub type Headers = ahash::AHashMap<String, String>;

/// UTC instant (RFC 3339) at which the tagged message becomes due
pub const DELIVER_AT: &str = "Deferral.Transport.DelayedDelivery.DeliverAt";

/// Address the tagged message is routed to once due
pub const DESTINATION: &str = "Deferral.Transport.DelayedDelivery.Destination";

/// Queue the failing message was being processed from
pub const FAILED_QUEUE: &str = "Deferral.FailedQ";

/// Time the failure was recorded (RFC 3339)
pub const TIME_OF_FAILURE: &str = "Deferral.TimeOfFailure";

pub const EXCEPTION_TYPE: &str = "Deferral.ExceptionInfo.ExceptionType";
pub const EXCEPTION_MESSAGE: &str = "Deferral.ExceptionInfo.Message";
pub const EXCEPTION_SOURCE: &str = "Deferral.ExceptionInfo.Source";
pub const EXCEPTION_CAUSES: &str = "Deferral.ExceptionInfo.Causes";

/// Remove the scheduling headers, returning `(deliver_at, destination)`
pub fn take_scheduling(headers: &mut Headers) -> (Option<String>, Option<String>) {
    (headers.remove(DELIVER_AT), headers.remove(DESTINATION))
}

/// Whether the headers carry a deliver-later instruction
#[must_use]
pub fn is_scheduled(headers: &Headers) -> bool {
    headers.contains_key(DELIVER_AT) || headers.contains_key(DESTINATION)
}
